//! Shared resources threaded through a connection's lifecycle phases.

use std::sync::Arc;

use crate::config::Config;
use crate::network::ratelimit::TokenBuckets;
use crate::or_link::registry::OrLinkRegistry;
use crate::or_link::broken_counter::ProtocolBrokenCounter;

/// Resources every connection task needs regardless of `ConnectionKind`,
/// grouped to keep `Connection::run`'s signature small.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub registry: Arc<OrLinkRegistry>,
    pub buckets: Arc<parking_lot::Mutex<TokenBuckets>>,
    pub broken_counter: Arc<ProtocolBrokenCounter>,
}
