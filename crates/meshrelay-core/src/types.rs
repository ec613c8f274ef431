//! Core types for the meshrelay protocol
//!
//! This module defines the fundamental types used throughout the engine,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a peer, derived from its 32-byte public key.
///
/// The ID doubles as the routing address: XOR distance between two IDs is the
/// Kademlia proximity metric used for ranking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Create a new PeerId from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a PeerId from a slice, zero-padding or truncating to 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 32];
        let len = core::cmp::min(bytes.len(), 32);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bitwise XOR distance to another peer in ID space
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut dist = [0u8; 32];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }
}

/// Compare two XOR distances lexicographically (smaller = closer)
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> core::cmp::Ordering {
    a.iter().cmp(b.iter())
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full IDs are noisy in logs; show the leading 8 bytes
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PeerId {
    type Err = crate::MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean)
            .map_err(|_| crate::MeshError::decode("invalid hex in PeerId"))?;
        if bytes.len() != 32 {
            return Err(crate::MeshError::decode("PeerId must be exactly 32 bytes"));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl Deref for PeerId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Content-derived message identifier (SHA-256 over the signable bytes).
///
/// Used as the dedup key and as the unit of courier-sync reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    /// Create a MessageId from hash bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string for display and storage keys
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live (TTL)
// ----------------------------------------------------------------------------

/// Relay-count limit preventing infinite forwarding loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    /// Default TTL for new messages
    pub const DEFAULT: Self = Self(7);

    /// Create a new TTL
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// True once the relay budget is exhausted
    pub fn is_expired(&self) -> bool {
        self.0 == 0
    }

    /// Decrement TTL, returning None if it is already 0
    pub fn decrement(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Transport Kind
// ----------------------------------------------------------------------------

/// Physical medium a peer link runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Local network (highest bandwidth)
    Lan,
    /// WebRTC data channel
    WebRtc,
    /// Opportunistic store-and-forward carry
    Sneakernet,
    /// Bluetooth Low Energy GATT (lowest bandwidth)
    Ble,
}

impl TransportKind {
    /// Bandwidth bonus contributed to the routing score (0-100).
    ///
    /// Local/LAN transports score highest, BLE lowest.
    pub fn bandwidth_bonus(&self) -> f64 {
        match self {
            TransportKind::Lan => 100.0,
            TransportKind::WebRtc => 75.0,
            TransportKind::Sneakernet => 40.0,
            TransportKind::Ble => 15.0,
        }
    }
}

// ----------------------------------------------------------------------------
// Priority
// ----------------------------------------------------------------------------

/// Priority class of a message, driving retention TTL and eviction order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Emergency = 3,
}

impl Priority {
    /// Convert from u8, returning None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Emergency),
            _ => None,
        }
    }

    /// Retention window for undelivered stored messages of this class
    pub fn retention(&self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            Priority::Low => Duration::from_secs(24 * HOUR),
            Priority::Normal => Duration::from_secs(7 * 24 * HOUR),
            Priority::High => Duration::from_secs(14 * 24 * HOUR),
            Priority::Emergency => Duration::from_secs(30 * 24 * HOUR),
        }
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for providing timestamps, so core logic stays testable without
/// touching the wall clock.
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of [`TimeSource`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually-advanced clock for tests and simulations
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a clock starting at the given millisecond offset
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Advance the clock
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute time
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_round_trip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = PeerId::new(bytes);
        assert_eq!(id.as_bytes(), &bytes);

        let parsed: PeerId = hex::encode(bytes).parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_xor_distance_ordering() {
        let a = PeerId::from_bytes(&[0b0000_0001]);
        let b = PeerId::from_bytes(&[0b0000_0011]);
        let c = PeerId::from_bytes(&[0b1000_0000]);

        let ab = a.xor_distance(&b);
        let ac = a.xor_distance(&c);
        assert_eq!(distance_cmp(&ab, &ac), core::cmp::Ordering::Less);

        // Distance to self is zero
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn test_ttl_decrement() {
        let mut ttl = Ttl::new(2);
        ttl = ttl.decrement().unwrap();
        ttl = ttl.decrement().unwrap();
        assert!(ttl.is_expired());
        assert!(ttl.decrement().is_none());
    }

    #[test]
    fn test_priority_retention_ordering() {
        assert!(Priority::Low.retention() < Priority::Normal.retention());
        assert!(Priority::Normal.retention() < Priority::High.retention());
        assert!(Priority::High.retention() < Priority::Emergency.retention());
        assert!(Priority::Low < Priority::Emergency);
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(1_000);
        assert_eq!(clock.now().as_millis(), 1_000);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now().as_millis(), 6_000);
    }
}
