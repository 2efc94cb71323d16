//! Census of links that die before reaching `Open` (§4.9).
//!
//! Every time a link closes without completing its handshake, its label
//! — `"<conn_state> with SSL state <tls_state>"` — is tallied. A
//! background task periodically logs and publishes the top-N labels so an
//! operator can spot a misconfigured peer or a broken TLS stack without
//! drowning in per-connection noise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::metrics::BROKEN_STATE_COUNTS;

/// How often the reporter task logs and republishes the top labels.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3600);

/// How many of the most frequent labels get logged/published each cycle.
const TOP_N: usize = 10;

pub struct ProtocolBrokenCounter {
    counts: DashMap<String, u64>,
    enabled: AtomicBool,
}

impl ProtocolBrokenCounter {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            enabled: AtomicBool::new(true),
        }
    }

    /// Build the `"<conn_state> with SSL state <tls_state>"` label for a
    /// non-Open close and record it.
    pub fn record(&self, conn_state: &str, tls_state: &str) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let label = format!("{conn_state} with SSL state {tls_state}");
        *self.counts.entry(label).or_insert(0) += 1;
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.counts.clear();
    }

    /// Snapshot the `n` most frequent labels, highest count first.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.truncate(n);
        all
    }

    /// Log and publish the top labels, then clear accumulated counts for
    /// the next reporting period.
    pub fn report_and_clear(&self) {
        for (label, count) in self.top(TOP_N) {
            info!(label = %label, count, "broken handshake state");
            BROKEN_STATE_COUNTS.with_label_values(&[&label]).set(count as i64);
        }
        self.clear();
    }
}

impl Default for ProtocolBrokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic reporter task. Runs until the process exits.
pub fn spawn_reporter(counter: std::sync::Arc<ProtocolBrokenCounter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        loop {
            ticker.tick().await;
            counter.report_and_clear();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_builds_expected_label() {
        let counter = ProtocolBrokenCounter::new();
        counter.record("AUTH_CHALLENGE_WAIT", "before_handshake");
        let top = counter.top(1);
        assert_eq!(top[0].0, "AUTH_CHALLENGE_WAIT with SSL state before_handshake");
        assert_eq!(top[0].1, 1);
    }

    #[test]
    fn disabled_counter_ignores_records() {
        let counter = ProtocolBrokenCounter::new();
        counter.disable();
        counter.record("X", "Y");
        assert!(counter.top(10).is_empty());
    }

    #[test]
    fn top_n_orders_by_count_descending() {
        let counter = ProtocolBrokenCounter::new();
        counter.record("A", "s");
        counter.record("B", "s");
        counter.record("B", "s");
        let top = counter.top(2);
        assert_eq!(top[0].0, "B with SSL state s");
        assert_eq!(top[0].1, 2);
    }

    #[test]
    fn clear_resets_counts() {
        let counter = ProtocolBrokenCounter::new();
        counter.record("A", "s");
        counter.clear();
        assert!(counter.top(10).is_empty());
    }
}
