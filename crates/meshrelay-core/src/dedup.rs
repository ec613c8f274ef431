//! Two-tier message deduplication
//!
//! Fast path: a Bloom filter tuned for ~100k message IDs at a <=1% false
//! positive rate. Ground truth: an append-only log of seen IDs in the
//! persistence adapter, with zero false positives. A Bloom hit always falls
//! through to the log before a message is skipped; a Bloom miss means the
//! message is definitely new. The filter is rebuilt from the log at startup
//! and is never the source of truth.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DedupConfig;
use crate::persistence::PersistenceAdapter;
use crate::types::{MessageId, TimeSource, Timestamp};
use crate::Result;

/// Storage key prefix for the persistent seen log
const LOG_PREFIX: &str = "dedup/";

// ----------------------------------------------------------------------------
// Bloom Filter
// ----------------------------------------------------------------------------

/// Probabilistic membership filter over message IDs.
///
/// Also serialized as the compact summary exchanged during courier sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_functions: usize,
    bit_size: usize,
}

impl BloomFilter {
    /// Create a new Bloom filter with an explicit bit size
    pub fn new(bit_size: usize, hash_functions: usize) -> Self {
        let bit_size = bit_size.max(8);
        Self {
            bits: vec![0u8; bit_size.div_ceil(8)],
            hash_functions,
            bit_size,
        }
    }

    /// Create a filter sized for the expected element count and target
    /// false-positive rate, with the configured number of hash functions
    pub fn for_capacity(expected_elements: usize, false_positive_rate: f64, hashes: usize) -> Self {
        let bit_size = Self::optimal_bit_size(expected_elements, false_positive_rate);
        Self::new(bit_size, hashes)
    }

    /// Create a filter from dedup configuration
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::for_capacity(
            config.expected_messages,
            config.false_positive_rate,
            config.hash_functions,
        )
    }

    /// Optimal bit array size: m = -n * ln(p) / ln(2)^2
    fn optimal_bit_size(expected_elements: usize, false_positive_rate: f64) -> usize {
        let n = expected_elements.max(1) as f64;
        let p = false_positive_rate;
        let m = -(n * p.ln()) / (2.0_f64.ln().powi(2));
        m.ceil() as usize
    }

    /// Seeded hash of a message ID for one filter position
    fn index(&self, id: &MessageId, seed: u32) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(seed.to_be_bytes());
        hasher.update(id.as_bytes());
        let digest = hasher.finalize();
        let hash = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        (hash as usize) % self.bit_size
    }

    /// Add a message ID to the filter
    pub fn add(&mut self, id: &MessageId) {
        for seed in 0..self.hash_functions {
            let bit = self.index(id, seed as u32);
            self.bits[bit / 8] |= 1u8 << (bit % 8);
        }
    }

    /// Membership test: false means definitely absent, true means maybe
    pub fn contains(&self, id: &MessageId) -> bool {
        (0..self.hash_functions).all(|seed| {
            let bit = self.index(id, seed as u32);
            (self.bits[bit / 8] & (1u8 << (bit % 8))) != 0
        })
    }

    /// Clear all bits
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Fraction of bits set
    pub fn fill_ratio(&self) -> f64 {
        let set: usize = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        set as f64 / self.bit_size as f64
    }

    /// Memory footprint in bytes
    pub fn memory_usage(&self) -> usize {
        self.bits.len()
    }
}

// ----------------------------------------------------------------------------
// Dedup Entry
// ----------------------------------------------------------------------------

/// Persistent log record: one seen message ID and when it was first seen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub first_seen: Timestamp,
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters for dedup behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupStats {
    /// Total `should_process` checks
    pub checks: u64,
    /// Checks resolved as duplicates (confirmed by the log)
    pub duplicates: u64,
    /// Bloom hits the log overruled
    pub bloom_false_positives: u64,
}

// ----------------------------------------------------------------------------
// Deduplication Manager
// ----------------------------------------------------------------------------

/// Owns the Bloom filter and the persistent seen log
pub struct DeduplicationManager<T: TimeSource> {
    filter: BloomFilter,
    store: Arc<dyn PersistenceAdapter>,
    config: DedupConfig,
    time_source: T,
    /// Live count of log entries, maintained to enforce the size valve
    log_len: usize,
    stats: DedupStats,
}

impl<T: TimeSource> DeduplicationManager<T> {
    /// Create a manager and rebuild the filter from the persisted log
    pub fn new(
        config: DedupConfig,
        store: Arc<dyn PersistenceAdapter>,
        time_source: T,
    ) -> Result<Self> {
        let mut manager = Self {
            filter: BloomFilter::from_config(&config),
            store,
            config,
            time_source,
            log_len: 0,
            stats: DedupStats::default(),
        };
        manager.rebuild_from_log()?;
        Ok(manager)
    }

    fn log_key(id: &MessageId) -> String {
        format!("{LOG_PREFIX}{}", id.to_hex())
    }

    /// Decide whether a message should be processed.
    ///
    /// Returns true exactly when the ID has never been marked seen: a Bloom
    /// miss short-circuits, a Bloom hit is confirmed against the log.
    pub fn should_process(&mut self, id: &MessageId) -> Result<bool> {
        self.stats.checks += 1;

        if !self.filter.contains(id) {
            return Ok(true);
        }

        // Bloom says maybe; the log has the final word
        if self.store.get(&Self::log_key(id))?.is_some() {
            self.stats.duplicates += 1;
            Ok(false)
        } else {
            self.stats.bloom_false_positives += 1;
            Ok(true)
        }
    }

    /// Exact membership check against the log alone, with no false
    /// positives. Used for the explicit confirmation round of courier sync.
    pub fn seen(&self, id: &MessageId) -> Result<bool> {
        Ok(self.store.get(&Self::log_key(id))?.is_some())
    }

    /// Record a message ID as seen
    pub fn mark_seen(&mut self, id: &MessageId) -> Result<()> {
        let key = Self::log_key(id);
        if self.store.get(&key)?.is_none() {
            let entry = DedupEntry {
                first_seen: self.time_source.now(),
            };
            self.store.put(&key, &bincode::serialize(&entry)?)?;
            self.log_len += 1;
        }
        self.filter.add(id);

        if self.log_len > self.config.max_log_entries {
            self.enforce_log_valve()?;
        }
        Ok(())
    }

    /// Rebuild the Bloom filter by replaying the persistent log
    pub fn rebuild_from_log(&mut self) -> Result<()> {
        self.filter.clear();
        let entries = self.store.query_by_prefix(LOG_PREFIX)?;
        self.log_len = entries.len();
        for (key, _) in &entries {
            if let Ok(id) = MessageId::from_hex(&key[LOG_PREFIX.len()..]) {
                self.filter.add(&id);
            }
        }
        tracing::debug!(entries = self.log_len, "rebuilt dedup filter from log");
        Ok(())
    }

    /// Remove log entries older than `max_age`, returning the count pruned.
    ///
    /// The filter is left untouched: a stale Bloom hit now resolves to "new"
    /// through the log, which is exactly the intended semantics.
    pub fn prune_log(&mut self, max_age: core::time::Duration) -> Result<usize> {
        let cutoff = self
            .time_source
            .now()
            .as_millis()
            .saturating_sub(max_age.as_millis() as u64);

        let mut pruned = 0;
        for (key, value) in self.store.query_by_prefix(LOG_PREFIX)? {
            let entry: DedupEntry = match bincode::deserialize(&value) {
                Ok(entry) => entry,
                Err(_) => {
                    // Unreadable record: drop it rather than carry it forever
                    self.store.delete(&key)?;
                    pruned += 1;
                    continue;
                }
            };
            if entry.first_seen.as_millis() < cutoff {
                self.store.delete(&key)?;
                pruned += 1;
            }
        }
        self.log_len = self.log_len.saturating_sub(pruned);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned dedup log");
        }
        Ok(pruned)
    }

    /// Size valve: drop the oldest entries until the log fits the cap, so
    /// startup replay stays bounded even with periodic pruning disabled.
    fn enforce_log_valve(&mut self) -> Result<()> {
        let mut entries: Vec<(String, Timestamp)> = self
            .store
            .query_by_prefix(LOG_PREFIX)?
            .into_iter()
            .filter_map(|(key, value)| {
                bincode::deserialize::<DedupEntry>(&value)
                    .ok()
                    .map(|entry| (key, entry.first_seen))
            })
            .collect();
        entries.sort_by_key(|(_, first_seen)| *first_seen);

        let excess = entries.len().saturating_sub(self.config.max_log_entries);
        for (key, _) in entries.into_iter().take(excess) {
            self.store.delete(&key)?;
        }
        self.log_len = self.log_len.saturating_sub(excess);
        tracing::warn!(dropped = excess, "dedup log exceeded cap, dropped oldest entries");
        Ok(())
    }

    /// Snapshot of dedup counters
    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Number of entries currently in the persistent log
    pub fn log_len(&self) -> usize {
        self.log_len
    }

    /// Borrow the current filter (used as the courier sync summary)
    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
