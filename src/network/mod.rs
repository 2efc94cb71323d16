//! Networking: listener reconciliation, the generic per-socket
//! `Connection` state machine, bandwidth scheduling, and outbound proxy
//! dialing (§4.3–§4.6).

pub mod connection;
pub mod listener;
pub mod proxy_client;
pub mod ratelimit;

pub use connection::{Connection, ConnectionContext, ConnectionHooks, ConnectionKind};
pub use listener::Listener;
