//! Fixed and variable-length OR cell framing.
//!
//! Big-endian throughout. A fixed cell is `circ_id || command || payload`,
//! zero-padded to a constant total length; a variable cell is
//! `circ_id || command || payload_len(2) || payload`. The circ-id width is
//! 2 bytes for link-protocol <= 3 and widens to 4 bytes at link-protocol >=
//! 4, except `VERSIONS`, which always uses the 2-byte framing so peers can
//! negotiate the width before anything wider is exchanged.

use crate::error::WireError;

/// Payload length of a fixed cell, independent of circ-id width.
pub const PAYLOAD_LEN: usize = 509;

// Fixed commands used by the core.
pub const CMD_PADDING: u8 = 0;
pub const CMD_DESTROY: u8 = 4;
pub const CMD_NETINFO: u8 = 8;

// Variable-length commands used by the core.
pub const CMD_VERSIONS: u8 = 7;
pub const CMD_VPADDING: u8 = 128;
pub const CMD_CERTS: u8 = 129;
pub const CMD_AUTH_CHALLENGE: u8 = 130;
pub const CMD_AUTHENTICATE: u8 = 131;

/// Whether `command` is framed as a variable-length cell.
pub fn is_variable_length(command: u8) -> bool {
    matches!(
        command,
        CMD_VERSIONS | CMD_VPADDING | CMD_CERTS | CMD_AUTH_CHALLENGE | CMD_AUTHENTICATE
    )
}

/// Width in bytes of the circ-id field for `command` at `link_proto`.
///
/// `VERSIONS` is always 2 bytes regardless of the negotiated link
/// protocol; every other command widens to 4 bytes once `link_proto >= 4`.
pub fn circ_id_len(link_proto: u16, command: u8) -> usize {
    if command == CMD_VERSIONS {
        2
    } else if link_proto >= 4 {
        4
    } else {
        2
    }
}

/// Total wire length of a fixed cell at `link_proto` (512 or 514 bytes).
pub fn fixed_cell_len(link_proto: u16) -> usize {
    circ_id_len(link_proto, CMD_PADDING) + 1 + PAYLOAD_LEN
}

/// A fixed-width cell. `circ_id` is always stored widened to `u32`; the
/// wire width is determined by `link_proto` at pack/unpack time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circ_id: u32, command: u8, mut payload: Vec<u8>) -> Self {
        payload.truncate(PAYLOAD_LEN);
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// Encode to the on-wire representation for `link_proto`.
    pub fn pack(&self, link_proto: u16) -> Vec<u8> {
        let id_len = circ_id_len(link_proto, self.command);
        let total = id_len + 1 + PAYLOAD_LEN;
        let mut out = Vec::with_capacity(total);
        push_circ_id(&mut out, self.circ_id, id_len);
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        out.resize(total, 0);
        out
    }

    /// Decode a fixed cell of exactly `fixed_cell_len(link_proto)` bytes.
    pub fn unpack(bytes: &[u8], link_proto: u16) -> Result<Cell, WireError> {
        let expected = fixed_cell_len(link_proto);
        if bytes.len() != expected {
            return Err(WireError::BadFixedCellLength {
                expected,
                actual: bytes.len(),
            });
        }
        let id_len = circ_id_len(link_proto, CMD_PADDING);
        let circ_id = read_circ_id(&bytes[..id_len]);
        let command = bytes[id_len];
        let payload = bytes[id_len + 1..].to_vec();
        Ok(Cell {
            circ_id,
            command,
            payload,
        })
    }
}

/// A variable-length cell: `circ_id || command || payload_len(2) || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCell {
    pub circ_id: u32,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl VarCell {
    pub fn new(circ_id: u32, command: u8, payload: Vec<u8>) -> Self {
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// Length of the header (circ-id + command + 2-byte length prefix).
    pub fn header_len(link_proto: u16, command: u8) -> usize {
        circ_id_len(link_proto, command) + 1 + 2
    }

    /// Pack the header only (caller appends `payload` separately if streaming).
    pub fn pack_header(&self, link_proto: u16) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(WireError::VarCellTooLarge {
                actual: self.payload.len(),
                limit: u16::MAX as usize,
            });
        }
        let id_len = circ_id_len(link_proto, self.command);
        let mut out = Vec::with_capacity(id_len + 3);
        push_circ_id(&mut out, self.circ_id, id_len);
        out.push(self.command);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        Ok(out)
    }

    /// Pack header and payload together.
    pub fn pack(&self, link_proto: u16) -> Result<Vec<u8>, WireError> {
        let mut out = self.pack_header(link_proto)?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a complete var cell buffer (header + payload, nothing extra).
    ///
    /// `link_proto` must reflect what the peer has already negotiated: the
    /// 2-byte `VERSIONS` exception only ever matters while link-protocol
    /// negotiation is still in flight, which is exactly when the caller
    /// should pass a `link_proto < 4` (0 before any VERSIONS has been
    /// received). Once a width >= 4 has been negotiated, `VERSIONS` cells no
    /// longer appear on the wire, so no command-dependent guess is needed.
    pub fn unpack(bytes: &[u8], link_proto: u16) -> Result<VarCell, WireError> {
        let id_len = if link_proto >= 4 { 4 } else { 2 };
        let header_len = id_len + 3;
        if bytes.len() < header_len {
            return Err(WireError::Truncated {
                needed: header_len,
                actual: bytes.len(),
            });
        }
        let circ_id = read_circ_id(&bytes[..id_len]);
        let command = bytes[id_len];
        let len_bytes = [bytes[id_len + 1], bytes[id_len + 2]];
        let payload_len = u16::from_be_bytes(len_bytes) as usize;
        if bytes.len() != header_len + payload_len {
            return Err(WireError::Truncated {
                needed: header_len + payload_len,
                actual: bytes.len(),
            });
        }
        let payload = bytes[header_len..].to_vec();
        Ok(VarCell {
            circ_id,
            command,
            payload,
        })
    }
}

fn push_circ_id(out: &mut Vec<u8>, circ_id: u32, id_len: usize) {
    if id_len == 2 {
        out.extend_from_slice(&(circ_id as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&circ_id.to_be_bytes());
    }
}

fn read_circ_id(bytes: &[u8]) -> u32 {
    if bytes.len() == 2 {
        u16::from_be_bytes([bytes[0], bytes[1]]) as u32
    } else {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_cell_len_v3_is_512() {
        assert_eq!(fixed_cell_len(3), 512);
    }

    #[test]
    fn fixed_cell_len_v4_is_514() {
        assert_eq!(fixed_cell_len(4), 514);
    }

    #[test]
    fn fixed_cell_roundtrip_v3() {
        let c = Cell::new(7, CMD_DESTROY, vec![6, 0, 0, 0]);
        let packed = c.pack(3);
        assert_eq!(packed.len(), 512);
        let back = Cell::unpack(&packed, 3).unwrap();
        assert_eq!(back.circ_id, 7);
        assert_eq!(back.command, CMD_DESTROY);
        assert_eq!(&back.payload[..4], &[6, 0, 0, 0]);
    }

    #[test]
    fn fixed_cell_roundtrip_v4_widens_circ_id() {
        let c = Cell::new(0x1020_3040, CMD_NETINFO, vec![1, 2, 3]);
        let packed = c.pack(4);
        assert_eq!(packed.len(), 514);
        let back = Cell::unpack(&packed, 4).unwrap();
        assert_eq!(back.circ_id, 0x1020_3040);
    }

    #[test]
    fn fixed_cell_wrong_length_rejected() {
        let bytes = vec![0u8; 511];
        assert!(matches!(
            Cell::unpack(&bytes, 3),
            Err(WireError::BadFixedCellLength { .. })
        ));
    }

    #[test]
    fn var_cell_roundtrip() {
        let v = VarCell::new(9, CMD_CERTS, vec![1, 2, 3, 4, 5]);
        let packed = v.pack(3).unwrap();
        assert_eq!(packed.len(), VarCell::header_len(3, CMD_CERTS) + 5);
        let back = VarCell::unpack(&packed, 3).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn versions_cell_always_uses_two_byte_circ_id() {
        let v = VarCell::new(0xAB, CMD_VERSIONS, vec![0, 3, 0, 4]);
        let packed = v.pack(4).unwrap();
        // 2-byte circ-id + 1 command + 2 len = 5-byte header, even at link_proto 4.
        assert_eq!(&packed[0..2], &0xABu16.to_be_bytes());
        assert_eq!(packed.len(), 5 + 4);
    }

    #[test]
    fn var_cell_truncated_is_rejected() {
        let bytes = vec![0, 9, CMD_CERTS, 0, 5, 1, 2];
        assert!(matches!(
            VarCell::unpack(&bytes, 3),
            Err(WireError::Truncated { .. })
        ));
    }
}
