//! Round-trip / idempotence laws from spec §8.

use or_wire::cell::{Cell, VarCell, CMD_CERTS, CMD_DESTROY};
use proptest::prelude::*;

proptest! {
    #[test]
    fn fixed_cell_roundtrips_at_v3(circ_id in 0u32..=0xFFFF, payload in proptest::collection::vec(any::<u8>(), 0..=509)) {
        let cell = Cell::new(circ_id, CMD_DESTROY, payload.clone());
        let packed = cell.pack(3);
        let back = Cell::unpack(&packed, 3).unwrap();
        prop_assert_eq!(back.circ_id, circ_id);
        prop_assert_eq!(back.command, CMD_DESTROY);
        prop_assert_eq!(&back.payload[..payload.len()], payload.as_slice());
    }

    #[test]
    fn fixed_cell_roundtrips_at_v4_with_wide_circ_id(circ_id in any::<u32>(), payload in proptest::collection::vec(any::<u8>(), 0..=509)) {
        let cell = Cell::new(circ_id, CMD_DESTROY, payload);
        let packed = cell.pack(4);
        prop_assert_eq!(packed.len(), 514);
        let back = Cell::unpack(&packed, 4).unwrap();
        prop_assert_eq!(back.circ_id, circ_id);
    }

    #[test]
    fn var_cell_roundtrips(circ_id in 0u32..=0xFFFF, payload in proptest::collection::vec(any::<u8>(), 0..=4096)) {
        let cell = VarCell::new(circ_id, CMD_CERTS, payload);
        let packed = cell.pack(3).unwrap();
        let back = VarCell::unpack(&packed, 3).unwrap();
        prop_assert_eq!(back, cell);
    }
}
