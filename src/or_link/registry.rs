//! Identity-keyed OR-link registry (§4.8).
//!
//! Replaces the intrusive `next_with_same_id` chain of the original design
//! (§9 redesign notes) with a `DashMap<identity, Vec<handle>>` multimap:
//! each identity may have more than one concurrent link (a reconnect race,
//! or a deliberate parallel link) while reuse-selection policy picks the
//! best one to extend circuits through.
//!
//! # Thread Safety
//!
//! All operations are thread-safe via `DashMap`. The lock order follows
//! the same convention as other registries in this engine: DashMap shard
//! lock -> per-link `RwLock`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::{IdentityDigest, OrLinkShared};

pub type OrLinkHandle = Arc<RwLock<OrLinkShared>>;

/// A link less than this old is never starved in favor of a busier one
/// (§4.7 `get_for_extend` grace window).
const GRACE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// A link older than this is always bad for new circuits (§4.7
/// `set_bad_connections` age pass).
const MAX_LINK_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Outcome of [`OrLinkRegistry::get_for_extend`]: either a link to reuse,
/// or a signal for the caller about what to do instead.
pub enum ExtendOutcome {
    /// Reuse this link.
    Use(OrLinkHandle),
    /// A link to this identity at the target address is already being
    /// established; don't dial a second one.
    ConnectingWait,
    /// Dial a new link.
    DialNew,
}

/// All currently live OR links, keyed by peer identity digest.
pub struct OrLinkRegistry {
    by_identity: DashMap<IdentityDigest, Vec<OrLinkHandle>>,
}

impl OrLinkRegistry {
    pub fn new() -> Self {
        Self {
            by_identity: DashMap::new(),
        }
    }

    /// Record `handle` under `identity`, once its identity has been
    /// bound during the handshake (§4.7 identity binding).
    pub fn set_identity(&self, identity: IdentityDigest, handle: OrLinkHandle) {
        self.by_identity.entry(identity).or_default().push(handle);
    }

    /// Drop `handle` from whatever identity bucket it's under. A no-op if
    /// the link was never bound to an identity (closed mid-handshake) or
    /// already removed.
    pub fn remove(&self, identity: &IdentityDigest, handle: &OrLinkHandle) {
        if let Some(mut bucket) = self.by_identity.get_mut(identity) {
            bucket.retain(|h| !Arc::ptr_eq(h, handle));
        }
        if self
            .by_identity
            .get(identity)
            .map(|b| b.is_empty())
            .unwrap_or(false)
        {
            self.by_identity.remove(identity);
        }
    }

    /// All links currently registered under `identity`.
    pub fn find(&self, identity: &IdentityDigest) -> Vec<OrLinkHandle> {
        self.by_identity
            .get(identity)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Every handle in the registry, across all identities.
    pub fn iter_all(&self) -> Vec<OrLinkHandle> {
        self.by_identity
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Reuse-selection policy for extending a circuit to `identity` at
    /// `target_addr` (§4.7 `get_for_extend`):
    /// 1. A link that is a connection with a client is never reusable for
    ///    extending circuits through.
    /// 2. A non-canonical link whose `real_addr` doesn't match
    ///    `target_addr` is skipped — we only reuse an address we didn't
    ///    originate the connection to if it's canonical.
    /// 3. A link already marked bad for new circuits is skipped.
    /// 4. Among survivors, prefer canonical over non-canonical; within a
    ///    tier, prefer the one with active circuits unless the other is
    ///    within its 15-minute grace window (don't starve a just-built
    ///    link), then prefer the newer link.
    /// 5. If nothing survives, report `DialNew` with a reason of
    ///    `"all too old/noncanonical, dial new"` if anything was skipped
    ///    for badness/address, else `"not connected, dial new"`.
    ///
    /// This registry only holds links that finished their handshake, so
    /// there is no table of in-flight dials to report `ConnectingWait`
    /// from; callers never observe it today, but the outcome stays
    /// three-valued to match what a dial-tracking extension would need.
    pub fn get_for_extend(&self, identity: &IdentityDigest, target_addr: SocketAddr) -> (ExtendOutcome, &'static str) {
        let all = self.find(identity);
        if all.is_empty() {
            return (ExtendOutcome::DialNew, "not connected, dial new");
        }

        let mut skipped_any = false;
        let mut candidates: Vec<OrLinkHandle> = Vec::new();
        for h in &all {
            let g = h.read();
            if g.is_connection_with_client {
                skipped_any = true;
                continue;
            }
            if g.is_bad_for_new_circs {
                skipped_any = true;
                continue;
            }
            if !g.is_canonical && g.real_addr != target_addr {
                skipped_any = true;
                continue;
            }
            drop(g);
            candidates.push(h.clone());
        }

        match rank_best(&candidates) {
            Some(best) => (ExtendOutcome::Use(best), "reusing existing link"),
            None if skipped_any => (ExtendOutcome::DialNew, "all too old/noncanonical, dial new"),
            None => (ExtendOutcome::DialNew, "not connected, dial new"),
        }
    }

    /// Badness-marking sweep (§4.7 `set_bad_connections`), run
    /// periodically, per identity:
    /// 1. Age pass: any link older than [`MAX_LINK_AGE`] is marked bad.
    /// 2. Canonical pass: if a canonical link survives pass 1, every
    ///    non-canonical link is marked bad (a canonical link is always
    ///    preferred, so a surviving non-canonical one is redundant).
    /// 3. Tiebreak pass: let `best` be [`rank_best`] of what's left. If
    ///    `best` is canonical, every other surviving link is marked bad.
    ///    Otherwise (no canonical link survived), another surviving link
    ///    is marked bad only if its `real_addr` matches `best`'s — a
    ///    non-canonical link to a different address might still be the
    ///    only route to that address and is left alone.
    pub fn set_bad_connections(&self) {
        for entry in self.by_identity.iter() {
            let bucket = entry.value();

            for h in bucket {
                if h.read().timestamp_created.elapsed() > MAX_LINK_AGE {
                    h.write().is_bad_for_new_circs = true;
                }
            }

            let still_good: Vec<OrLinkHandle> = bucket
                .iter()
                .filter(|h| !h.read().is_bad_for_new_circs)
                .cloned()
                .collect();
            let any_canonical = still_good.iter().any(|h| h.read().is_canonical);
            if any_canonical {
                for h in &still_good {
                    if !h.read().is_canonical {
                        h.write().is_bad_for_new_circs = true;
                    }
                }
            }

            let still_good: Vec<OrLinkHandle> = still_good
                .into_iter()
                .filter(|h| !h.read().is_bad_for_new_circs)
                .collect();
            let Some(best) = rank_best(&still_good) else {
                continue;
            };
            let best_canonical = best.read().is_canonical;
            let best_addr = best.read().real_addr;
            for h in &still_good {
                if Arc::ptr_eq(h, &best) {
                    continue;
                }
                let mark_bad = if best_canonical {
                    true
                } else {
                    h.read().real_addr == best_addr
                };
                if mark_bad {
                    h.write().is_bad_for_new_circs = true;
                }
            }
        }
    }
}

impl Default for OrLinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rank `candidates` by (canonical tier, then circuit count / grace
/// window, then recency) and return the single best, per §4.7's ordering
/// shared by `get_for_extend` and `set_bad_connections`.
fn rank_best(candidates: &[OrLinkHandle]) -> Option<OrLinkHandle> {
    if candidates.is_empty() {
        return None;
    }
    let canonical: Vec<&OrLinkHandle> = candidates.iter().filter(|h| h.read().is_canonical).collect();
    let pool: Vec<&OrLinkHandle> = if canonical.is_empty() {
        candidates.iter().collect()
    } else {
        canonical
    };

    let mut best: Option<&OrLinkHandle> = None;
    for h in &pool {
        best = Some(match best {
            None => h,
            Some(cur) => {
                if is_better(&h.read(), &cur.read()) {
                    h
                } else {
                    cur
                }
            }
        });
    }
    best.cloned()
}

/// True if `a` should be preferred over `b` within the same canonical
/// tier: the one with active circuits wins, unless the other is still
/// within its grace window, in which case the newer link wins; ties
/// (both or neither have circuits) go to the newer link.
fn is_better(a: &OrLinkShared, b: &OrLinkShared) -> bool {
    let a_has_circuits = a.n_circuits.load(Ordering::Relaxed) > 0;
    let b_has_circuits = b.n_circuits.load(Ordering::Relaxed) > 0;
    if a_has_circuits != b_has_circuits {
        let (busy, quiet, quiet_is_a) = if a_has_circuits {
            (a, b, false)
        } else {
            (b, a, true)
        };
        let quiet_in_grace = quiet.timestamp_created.elapsed() < GRACE_WINDOW;
        return if quiet_in_grace { quiet_is_a } else { !quiet_is_a };
    }
    a.timestamp_created > b.timestamp_created
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const ADDR1: &str = "127.0.0.1:1";
    const ADDR2: &str = "127.0.0.1:2";

    fn handle(addr: &str, outgoing: bool, canonical: bool) -> OrLinkHandle {
        let mut shared = OrLinkShared::new(addr.parse::<SocketAddr>().unwrap(), outgoing);
        shared.is_canonical = canonical;
        shared.identity_digest = Some([7u8; 20]);
        Arc::new(RwLock::new(shared))
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn find_returns_all_links_for_identity() {
        let registry = OrLinkRegistry::new();
        let id = [1u8; 20];
        registry.set_identity(id, handle(ADDR1, true, false));
        registry.set_identity(id, handle(ADDR2, true, false));
        assert_eq!(registry.find(&id).len(), 2);
    }

    #[test]
    fn remove_drops_handle_and_empties_bucket() {
        let registry = OrLinkRegistry::new();
        let id = [2u8; 20];
        let h = handle(ADDR1, true, false);
        registry.set_identity(id, h.clone());
        registry.remove(&id, &h);
        assert!(registry.find(&id).is_empty());
    }

    #[test]
    fn get_for_extend_prefers_canonical_outgoing() {
        let registry = OrLinkRegistry::new();
        let id = [3u8; 20];
        let plain = handle(ADDR1, false, false);
        let canon = handle(ADDR2, true, true);
        registry.set_identity(id, plain.clone());
        registry.set_identity(id, canon.clone());
        let (outcome, _) = registry.get_for_extend(&id, addr(ADDR2));
        match outcome {
            ExtendOutcome::Use(chosen) => assert!(Arc::ptr_eq(&chosen, &canon)),
            _ => panic!("expected a reusable link"),
        }
    }

    #[test]
    fn get_for_extend_skips_bad_links() {
        let registry = OrLinkRegistry::new();
        let id = [4u8; 20];
        let h = handle(ADDR1, true, true);
        h.write().is_bad_for_new_circs = true;
        registry.set_identity(id, h);
        let (outcome, reason) = registry.get_for_extend(&id, addr(ADDR1));
        assert!(matches!(outcome, ExtendOutcome::DialNew));
        assert_eq!(reason, "all too old/noncanonical, dial new");
    }

    #[test]
    fn get_for_extend_skips_noncanonical_link_at_mismatched_address() {
        let registry = OrLinkRegistry::new();
        let id = [6u8; 20];
        let h = handle(ADDR1, false, false);
        registry.set_identity(id, h);
        let (outcome, reason) = registry.get_for_extend(&id, addr(ADDR2));
        assert!(matches!(outcome, ExtendOutcome::DialNew));
        assert_eq!(reason, "all too old/noncanonical, dial new");
    }

    #[test]
    fn get_for_extend_with_no_links_reports_not_connected() {
        let registry = OrLinkRegistry::new();
        let (outcome, reason) = registry.get_for_extend(&[9u8; 20], addr(ADDR1));
        assert!(matches!(outcome, ExtendOutcome::DialNew));
        assert_eq!(reason, "not connected, dial new");
    }

    #[test]
    fn set_bad_connections_keeps_exactly_one_canonical_link() {
        let registry = OrLinkRegistry::new();
        let id = [5u8; 20];
        let a = handle(ADDR1, true, true);
        let b = handle(ADDR2, true, true);
        registry.set_identity(id, a.clone());
        registry.set_identity(id, b.clone());
        registry.set_bad_connections();
        let usable = registry
            .find(&id)
            .into_iter()
            .filter(|h| !h.read().is_bad_for_new_circs)
            .count();
        assert_eq!(usable, 1);
    }

    #[test]
    fn set_bad_connections_marks_old_links_bad() {
        let registry = OrLinkRegistry::new();
        let id = [8u8; 20];
        let h = handle(ADDR1, true, true);
        h.write().timestamp_created = std::time::Instant::now() - (MAX_LINK_AGE + Duration::from_secs(1));
        registry.set_identity(id, h.clone());
        registry.set_bad_connections();
        assert!(h.read().is_bad_for_new_circs);
    }
}
