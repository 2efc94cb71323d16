//! Wire-format layer for the OR-link connection engine.
//!
//! This crate has no async runtime and no sockets: it only knows how to
//! frame bytes into cells, pack/unpack the handshake cell bodies, accumulate
//! the v3 handshake transcript digests, and parse the client-side proxy
//! dialing protocols (HTTPS-CONNECT, SOCKS4, SOCKS5). The daemon crate
//! (`orlinkd`) owns every socket and supplies bytes to this layer.

pub mod buffer;
pub mod cell;
pub mod digest;
pub mod error;
pub mod handshake_cells;
pub mod socks;

pub use buffer::Buffer;
pub use cell::{Cell, VarCell};
pub use digest::{Direction, TranscriptDigest};
pub use error::WireError;
