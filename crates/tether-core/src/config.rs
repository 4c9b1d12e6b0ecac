// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replication configuration with JSON load/save.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_proto::MergeTable;

use crate::conflict::PolicyKind;

/// Failures loading, saving, or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file was not valid configuration JSON.
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
    /// A knob held a value outside its permitted range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunable knobs for the replication core.
///
/// All durations that govern in-tick behavior are expressed in ticks; the
/// millisecond knobs are converted against `tick_rate_hz` once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Fixed tick rate, in Hz.
    pub tick_rate_hz: u32,
    /// Heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// A peer unheard for longer than this is removed, in milliseconds.
    pub timeout_threshold_ms: u64,
    /// Maximum attached peers, including the local one.
    pub max_peers: usize,
    /// Maximum replicated entities.
    pub max_entities: usize,
    /// Retained history frames (the rollback window R).
    pub rollback_window_ticks: u64,
    /// Per-origin out-of-order tolerance, in sequence numbers.
    pub reorder_window: u32,
    /// Ticks between retransmits of an unacked message.
    pub retry_ticks: u64,
    /// Retransmits before a message is dropped with a timeout.
    pub max_retries: u32,
    /// Bodies larger than this are lz4-compressed on the wire, in bytes.
    pub compression_threshold_bytes: usize,
    /// Conflict policy for entities without an override.
    pub default_conflict_policy: PolicyKind,
    /// Per-entity conflict policy overrides.
    pub per_entity_policy_overrides: BTreeMap<String, PolicyKind>,
    /// Field merge rules for the merge policy (host configuration,
    /// replicated on join).
    pub merge_rules: MergeTable,
    /// Protocol violations from one origin before it is kicked.
    pub violation_kick_threshold: u32,
    /// Absolute tolerance when comparing predicted floats to authoritative
    /// ones.
    pub float_tolerance: f64,
    /// Ticks between RTT probe pings.
    pub ping_interval_ticks: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            heartbeat_interval_ms: 1000,
            timeout_threshold_ms: 10_000,
            max_peers: 32,
            max_entities: 10_000,
            rollback_window_ticks: 60,
            reorder_window: 32,
            retry_ticks: 15,
            max_retries: 3,
            compression_threshold_bytes: 100,
            default_conflict_policy: PolicyKind::HostAuthority,
            per_entity_policy_overrides: BTreeMap::new(),
            merge_rules: MergeTable::new(),
            violation_kick_threshold: 5,
            float_tolerance: 1e-6,
            ping_interval_ticks: 60,
        }
    }
}

impl ReplicationConfig {
    /// Validates knob ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending knob.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be nonzero"));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1"));
        }
        if self.rollback_window_ticks == 0 {
            return Err(ConfigError::Invalid(
                "rollback_window_ticks must be nonzero",
            ));
        }
        if !(0.0..f64::INFINITY).contains(&self.float_tolerance) {
            return Err(ConfigError::Invalid(
                "float_tolerance must be finite and non-negative",
            ));
        }
        Ok(())
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for io, parse, or validation failures.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Saves the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for io or serialization failures.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Nanoseconds per tick.
    #[must_use]
    pub fn tick_interval_nanos(&self) -> u64 {
        1_000_000_000 / u64::from(self.tick_rate_hz)
    }

    /// Ticks per heartbeat interval (at least 1).
    #[must_use]
    pub fn heartbeat_interval_ticks(&self) -> u64 {
        self.ms_to_ticks(self.heartbeat_interval_ms)
    }

    /// Ticks a peer may go unheard before the timeout sweep removes it.
    #[must_use]
    pub fn timeout_threshold_ticks(&self) -> u64 {
        self.ms_to_ticks(self.timeout_threshold_ms)
    }

    fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms * u64::from(self.tick_rate_hz) / 1000).max(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let cfg = ReplicationConfig::default();
        assert_eq!(cfg.tick_rate_hz, 60);
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.timeout_threshold_ms, 10_000);
        assert_eq!(cfg.rollback_window_ticks, 60);
        assert_eq!(cfg.reorder_window, 32);
        assert_eq!(cfg.retry_ticks, 15);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.compression_threshold_bytes, 100);
        assert_eq!(cfg.default_conflict_policy, PolicyKind::HostAuthority);
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn derived_tick_counts() {
        let cfg = ReplicationConfig::default();
        assert_eq!(cfg.heartbeat_interval_ticks(), 60);
        assert_eq!(cfg.timeout_threshold_ticks(), 600);
        assert_eq!(cfg.tick_interval_nanos(), 16_666_666);
    }

    #[test]
    fn zero_peers_is_rejected() {
        let cfg = ReplicationConfig {
            max_peers: 0,
            ..ReplicationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("replication.json");
        let mut cfg = ReplicationConfig::default();
        cfg.per_entity_policy_overrides
            .insert("e1".to_owned(), PolicyKind::Rollback);
        cfg.save(&path).expect("save");
        let back = ReplicationConfig::load(&path).expect("load");
        assert_eq!(back.per_entity_policy_overrides["e1"], PolicyKind::Rollback);
        assert_eq!(back.tick_rate_hz, cfg.tick_rate_hz);
    }
}
