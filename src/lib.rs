//! OR-link connection engine core: connection lifecycle, OR handshake,
//! connection pooling, cell framing (via `or_wire`), bandwidth scheduling,
//! listener management, and proxy-forwarded dialing.
//!
//! Circuit crypto, directory protocol, rendezvous/control-port protocol,
//! and persistent statistics are external collaborators and are not
//! implemented by this crate.

pub mod config;
pub mod error;
pub mod fd_budget;
pub mod metrics;
pub mod network;
pub mod or_link;

pub use error::OrLinkError;
