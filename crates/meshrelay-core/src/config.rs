//! Centralized configuration
//!
//! Consolidates every tunable used by the engine into one struct tree with
//! sensible defaults and a `testing()` preset for fast-clock test runs.

use core::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Routing Configuration
// ----------------------------------------------------------------------------

/// Tunables for the routing table's ranking and forward-set selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Score awarded when a candidate *is* the target
    pub direct_bonus: f64,
    /// Weight of a cached next-hop, scaled by its current quality (0-1)
    pub cached_route_weight: f64,
    /// Reputation penalty for degraded peers
    pub degraded_penalty: f64,
    /// Quality (0-100) below which the degraded penalty applies. Peers that
    /// are currently healthy take no penalty regardless of history.
    pub degraded_quality_threshold: f64,
    /// Connected-peer count at or below which every peer receives a copy
    pub sparse_peer_threshold: usize,
    /// Fraction of top-ranked peers selected in a dense topology
    pub dense_top_fraction: f64,
    /// Minimum forward-set size in a dense topology
    pub forward_set_floor: usize,
    /// How long an unreachable peer's record (and reputation) is retained
    pub peer_ttl: Duration,
    /// How long a cached route is trusted before lazy recomputation
    pub route_cache_ttl: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            direct_bonus: 2000.0,
            cached_route_weight: 300.0,
            degraded_penalty: 150.0,
            degraded_quality_threshold: 30.0,
            sparse_peer_threshold: 5,
            dense_top_fraction: 0.10,
            forward_set_floor: 5,
            peer_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            route_cache_ttl: Duration::from_secs(60),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Tunables for link health probing and reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Heartbeat probe interval
    pub heartbeat_interval: Duration,
    /// Silence past this threshold marks the link degraded
    pub stale_threshold: Duration,
    /// Initial reconnect delay
    pub reconnect_base_delay: Duration,
    /// Cap for exponential reconnect backoff
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f32,
    /// Reconnect attempts before the link is terminally disconnected
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            stale_threshold: Duration::from_secs(45),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 6,
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// Tunables for the store-and-forward relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interval between retry passes over stored messages
    pub retry_interval: Duration,
    /// Byte budget for at-rest stored messages
    pub storage_budget_bytes: usize,
    /// Fill ratio above which even Emergency messages become evictable
    pub critical_fill_ratio: f64,
    /// Default relay budget for new messages
    pub default_ttl: u8,
    /// Bounded wait for in-flight sends during shutdown drain
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            storage_budget_bytes: 16 * 1024 * 1024,
            critical_fill_ratio: 0.95,
            default_ttl: 7,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Configuration
// ----------------------------------------------------------------------------

/// Tunables for the two-tier dedup check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Expected unique message IDs the Bloom filter is sized for
    pub expected_messages: usize,
    /// Target Bloom false-positive rate
    pub false_positive_rate: f64,
    /// Number of Bloom hash functions
    pub hash_functions: usize,
    /// Hard cap on persistent log entries; oldest pruned beyond this.
    /// Bounds the startup rebuild cost even if periodic pruning is disabled.
    pub max_log_entries: usize,
    /// Log entries older than this are removed by the periodic prune
    pub prune_max_age: Duration,
    /// Interval between prune passes
    pub prune_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expected_messages: 100_000,
            false_positive_rate: 0.01,
            hash_functions: 7,
            max_log_entries: 200_000,
            prune_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the typed channels between tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Transport/timer -> logic task events (bursty)
    pub event_buffer_size: usize,
    /// Logic task -> transport effects
    pub effect_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 128,
            effect_buffer_size: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration for one mesh node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    pub routing: RoutingConfig,
    pub transport: TransportConfig,
    pub relay: RelayConfig,
    pub dedup: DedupConfig,
    pub channels: ChannelConfig,
}

impl MeshConfig {
    /// Preset with short timers for tests
    pub fn testing() -> Self {
        Self {
            transport: TransportConfig {
                heartbeat_interval: Duration::from_millis(50),
                stale_threshold: Duration::from_millis(150),
                reconnect_base_delay: Duration::from_millis(10),
                reconnect_max_delay: Duration::from_millis(100),
                max_reconnect_attempts: 3,
                ..TransportConfig::default()
            },
            relay: RelayConfig {
                retry_interval: Duration::from_millis(50),
                drain_timeout: Duration::from_millis(500),
                ..RelayConfig::default()
            },
            dedup: DedupConfig {
                prune_interval: Duration::from_millis(200),
                ..DedupConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        if self.routing.dense_top_fraction <= 0.0 || self.routing.dense_top_fraction > 1.0 {
            return Err("dense_top_fraction must be in (0, 1]".into());
        }
        if self.routing.forward_set_floor == 0 {
            return Err("forward_set_floor must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.dedup.false_positive_rate)
            || self.dedup.false_positive_rate == 0.0
        {
            return Err("false_positive_rate must be in (0, 1)".into());
        }
        if self.dedup.hash_functions == 0 {
            return Err("hash_functions must be at least 1".into());
        }
        if self.transport.stale_threshold < self.transport.heartbeat_interval {
            return Err("stale_threshold must be at least one heartbeat interval".into());
        }
        if self.relay.storage_budget_bytes == 0 {
            return Err("storage_budget_bytes must be non-zero".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MeshConfig::default().validate().is_ok());
        assert!(MeshConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = MeshConfig::default();
        config.routing.dense_top_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.dedup.false_positive_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.transport.stale_threshold = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
