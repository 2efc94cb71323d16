//! Token-bucket sizing configuration (§4.3).

use serde::Deserialize;

/// Rate and burst for the global buckets, plus optional per-connection
/// overrides. A rate of `0` (the default) means "no local override — fall
/// back to whatever the consensus/default supplies"; see
/// [`BandwidthConfig::effective_rate`] for the resolved precedence
/// (config-wins-if-positive-else-consensus-fallback, per the Open Question
/// this config layer makes explicit).
#[derive(Debug, Clone, Deserialize)]
pub struct BandwidthConfig {
    /// Aggregate bytes/sec across all connections. `0` defers to
    /// `consensus_rate`.
    #[serde(default)]
    pub rate: i64,
    #[serde(default)]
    pub burst: i64,
    /// Aggregate bytes/sec across relayed-only traffic. `0` defers to
    /// `consensus_relayed_rate`.
    #[serde(default)]
    pub relayed_rate: i64,
    #[serde(default)]
    pub relayed_burst: i64,
    /// Fallback rate used when `rate` is `0` (e.g. supplied by directory
    /// consensus in the full Tor system; here, a static config fallback).
    #[serde(default = "default_consensus_rate")]
    pub consensus_rate: i64,
    #[serde(default = "default_consensus_burst")]
    pub consensus_burst: i64,
    #[serde(default = "default_consensus_rate")]
    pub consensus_relayed_rate: i64,
    #[serde(default = "default_consensus_burst")]
    pub consensus_relayed_burst: i64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            rate: 0,
            burst: 0,
            relayed_rate: 0,
            relayed_burst: 0,
            consensus_rate: default_consensus_rate(),
            consensus_burst: default_consensus_burst(),
            consensus_relayed_rate: default_consensus_rate(),
            consensus_relayed_burst: default_consensus_burst(),
        }
    }
}

fn default_consensus_rate() -> i64 {
    1_000_000
}

fn default_consensus_burst() -> i64 {
    2_000_000
}

impl BandwidthConfig {
    /// Resolved (rate, burst) pair for the global direct-traffic bucket.
    pub fn effective_global(&self) -> (i64, i64) {
        if self.rate > 0 {
            (self.rate, self.burst.max(self.rate))
        } else {
            (self.consensus_rate, self.consensus_burst)
        }
    }

    /// Resolved (rate, burst) pair for the global relayed-traffic bucket.
    pub fn effective_relayed(&self) -> (i64, i64) {
        if self.relayed_rate > 0 {
            (self.relayed_rate, self.relayed_burst.max(self.relayed_rate))
        } else {
            (self.consensus_relayed_rate, self.consensus_relayed_burst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_falls_back_to_consensus() {
        let cfg = BandwidthConfig::default();
        assert_eq!(cfg.effective_global(), (cfg.consensus_rate, cfg.consensus_burst));
    }

    #[test]
    fn positive_rate_overrides_consensus() {
        let mut cfg = BandwidthConfig::default();
        cfg.rate = 500_000;
        cfg.burst = 750_000;
        assert_eq!(cfg.effective_global(), (500_000, 750_000));
    }

    #[test]
    fn burst_floor_is_rate_when_unset() {
        let mut cfg = BandwidthConfig::default();
        cfg.rate = 500_000;
        assert_eq!(cfg.effective_global(), (500_000, 500_000));
    }
}
