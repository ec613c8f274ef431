//! Distance-ranked peer routing
//!
//! Maintains live knowledge of peers (connection state, quality, reputation)
//! and answers the relay's question "who should I forward to". Candidates are
//! scored by direct-delivery match, cached route freshness, live link
//! quality, and transport bandwidth, with XOR-distance proximity breaking
//! ties. The forward set adapts to topology density: sparse meshes flood,
//! dense meshes pick the top slice.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::config::RoutingConfig;
use crate::types::{distance_cmp, PeerId, TimeSource, Timestamp, TransportKind};

/// Schema version for the peer metadata sub-struct
const PEER_METADATA_VERSION: u16 = 1;

/// Reputation starting point for a newly met peer
const INITIAL_REPUTATION: f64 = 50.0;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Live state of the link to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Disconnected,
}

// ----------------------------------------------------------------------------
// Peer Record
// ----------------------------------------------------------------------------

/// Versioned transport-level metadata attached to a peer record
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Metadata schema version, bumped when fields change meaning
    pub schema_version: u16,
    /// Transport the current link runs over
    pub transport: TransportKind,
    /// Rolling round-trip estimate in milliseconds
    pub rtt_ms: f64,
}

impl PeerMetadata {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            schema_version: PEER_METADATA_VERSION,
            transport,
            rtt_ms: 0.0,
        }
    }
}

/// Everything the table knows about one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub state: ConnectionState,
    pub metadata: PeerMetadata,
    /// Live link quality, 0-100
    pub quality: f64,
    /// Reputation 0-100, starts at 50
    pub reputation: f64,
    pub successes: u32,
    pub failures: u32,
    pub last_seen: Timestamp,
    /// Peer is excluded from ranking until this time passes
    pub blacklisted_until: Option<Timestamp>,
}

impl PeerRecord {
    /// Create a record for a peer first seen now
    pub fn new(id: PeerId, transport: TransportKind, now: Timestamp) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            metadata: PeerMetadata::new(transport),
            quality: 0.0,
            reputation: INITIAL_REPUTATION,
            successes: 0,
            failures: 0,
            last_seen: now,
            blacklisted_until: None,
        }
    }

    /// Link is usable for forwarding right now
    pub fn is_reachable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Degraded
        )
    }

    /// Peer is currently blacklisted
    pub fn is_blacklisted(&self, now: Timestamp) -> bool {
        self.blacklisted_until.is_some_and(|until| now < until)
    }

    fn record_success(&mut self) {
        self.successes += 1;
        self.reputation = (self.reputation + 2.0).min(100.0);
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.reputation = (self.reputation - 5.0).max(0.0);
    }
}

// ----------------------------------------------------------------------------
// Routing Entry
// ----------------------------------------------------------------------------

/// Cached next-hop knowledge for one destination. Derived state: recomputed
/// lazily, never persisted, and never references a peer absent from the
/// table.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub next_hops: SmallVec<[PeerId; 4]>,
    /// Route quality at the time the cache was refreshed, 0-100
    pub quality: f64,
    pub refreshed_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Routing Table
// ----------------------------------------------------------------------------

/// Ranked peer knowledge for one mesh node
pub struct RoutingTable<T: TimeSource> {
    local_id: PeerId,
    config: RoutingConfig,
    peers: HashMap<PeerId, PeerRecord>,
    routes: HashMap<PeerId, RoutingEntry>,
    time_source: T,
}

impl<T: TimeSource> RoutingTable<T> {
    pub fn new(local_id: PeerId, config: RoutingConfig, time_source: T) -> Self {
        Self {
            local_id,
            config,
            peers: HashMap::new(),
            routes: HashMap::new(),
            time_source,
        }
    }

    /// Local node ID
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Insert or replace a peer record wholesale
    pub fn add_or_update_peer(&mut self, record: PeerRecord) {
        self.peers.insert(record.id, record);
    }

    /// Remove a peer and every cached route that references it
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<PeerRecord> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            self.routes.remove(id);
            self.routes.retain(|_, entry| {
                entry.next_hops.retain(|hop| hop != id);
                !entry.next_hops.is_empty()
            });
        }
        removed
    }

    /// Borrow a peer record
    pub fn peer(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Number of known peers (any state)
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Apply a link update from the transport layer. Creates the record on
    /// first contact; refreshes state, quality, and RTT afterwards.
    pub fn apply_link_update(
        &mut self,
        peer_id: PeerId,
        transport: TransportKind,
        state: ConnectionState,
        quality: f64,
        rtt_ms: f64,
    ) {
        let now = self.time_source.now();
        let record = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| PeerRecord::new(peer_id, transport, now));
        record.state = state;
        record.quality = quality.clamp(0.0, 100.0);
        record.metadata.transport = transport;
        record.metadata.rtt_ms = rtt_ms;
        if state != ConnectionState::Disconnected {
            record.last_seen = now;
        }
    }

    /// Record a successful delivery via a peer
    pub fn record_success(&mut self, peer_id: &PeerId) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.record_success();
        }
    }

    /// Record a failed delivery attempt via a peer
    pub fn record_failure(&mut self, peer_id: &PeerId) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.record_failure();
        }
    }

    /// Exclude a peer from ranking until the given time. The record and its
    /// reputation stay in the table so history survives reconnects.
    pub fn blacklist(&mut self, peer_id: &PeerId, until: Timestamp) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.blacklisted_until = Some(until);
        }
    }

    /// Cache the hop a delivery toward `destination` succeeded through
    pub fn update_route(&mut self, destination: PeerId, next_hop: PeerId) {
        if !self.peers.contains_key(&next_hop) {
            return;
        }
        let quality = self
            .peers
            .get(&next_hop)
            .map(|record| record.quality)
            .unwrap_or(0.0);
        let now = self.time_source.now();
        let entry = self.routes.entry(destination).or_insert(RoutingEntry {
            next_hops: SmallVec::new(),
            quality,
            refreshed_at: now,
        });
        if !entry.next_hops.contains(&next_hop) {
            entry.next_hops.push(next_hop);
        }
        entry.quality = quality;
        entry.refreshed_at = now;
    }

    /// Peers the table considers usable right now
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        let now = self.time_source.now();
        self.peers
            .values()
            .filter(|record| record.is_reachable() && !record.is_blacklisted(now))
            .map(|record| record.id)
            .collect()
    }

    /// True when a direct, reachable link to the peer exists
    pub fn is_directly_connected(&self, peer_id: &PeerId) -> bool {
        let now = self.time_source.now();
        self.peers
            .get(peer_id)
            .is_some_and(|record| record.is_reachable() && !record.is_blacklisted(now))
    }

    /// Drop records not seen within the peer TTL
    pub fn expire_stale(&mut self) -> usize {
        let now = self.time_source.now();
        let ttl_ms = self.config.peer_ttl.as_millis() as u64;
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| now - record.last_seen > ttl_ms)
            .map(|record| record.id)
            .collect();
        for id in &stale {
            self.remove_peer(id);
        }
        stale.len()
    }

    // ------------------------------------------------------------------------
    // Ranking
    // ------------------------------------------------------------------------

    /// Score one candidate for forwarding toward `target`
    fn score(&self, record: &PeerRecord, target: &PeerId, now: Timestamp) -> f64 {
        let mut score = 0.0;

        // Direct delivery short-circuit
        if record.id == *target {
            score += self.config.direct_bonus;
        }

        // Cached next-hop, down-weighted by *live* quality so a stale known
        // route is never trusted blindly
        if let Some(entry) = self.routes.get(target) {
            let fresh = now.duration_since(entry.refreshed_at) <= self.config.route_cache_ttl;
            if fresh && entry.next_hops.contains(&record.id) {
                score += self.config.cached_route_weight * (record.quality / 100.0);
            }
        }

        // Live link quality baseline
        score += record.quality;

        // Bandwidth/transport bonus
        score += record.metadata.transport.bandwidth_bonus();

        // Fresh-start policy: the penalty needs both a troubled link *and*
        // poor current quality. History alone never penalizes.
        let troubled = record.state == ConnectionState::Degraded
            || record.reputation < INITIAL_REPUTATION - 10.0;
        if troubled && record.quality < self.config.degraded_quality_threshold {
            score -= self.config.degraded_penalty;
        }

        score
    }

    /// Rank reachable candidates for a target, best first. Ties are broken
    /// by XOR-distance proximity to the target (smaller wins).
    pub fn rank_peers_for_target(&self, target: &PeerId, exclude: &[PeerId]) -> Vec<PeerId> {
        let now = self.time_source.now();
        let mut scored: Vec<(PeerId, f64, [u8; 32])> = self
            .peers
            .values()
            .filter(|record| {
                record.id != self.local_id
                    && record.is_reachable()
                    && !record.is_blacklisted(now)
                    && !exclude.contains(&record.id)
            })
            .map(|record| {
                (
                    record.id,
                    self.score(record, target, now),
                    record.id.xor_distance(target),
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(core::cmp::Ordering::Equal)
                .then_with(|| distance_cmp(&a.2, &b.2))
        });

        scored.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Choose the forward set for a message.
    ///
    /// Sparse topology (<= threshold reachable peers) floods to everyone for
    /// redundancy. Dense topology takes the top slice by score (floored) to
    /// avoid broadcast storms. `target == None` is the broadcast/discovery
    /// fallback and always floods.
    pub fn select_forward_set(&self, target: Option<&PeerId>, exclude: &[PeerId]) -> Vec<PeerId> {
        let target = match target {
            Some(target) => target,
            None => {
                let mut all = self.reachable_peers();
                all.retain(|id| !exclude.contains(id));
                return all;
            }
        };

        let ranked = self.rank_peers_for_target(target, exclude);
        if ranked.len() <= self.config.sparse_peer_threshold {
            return ranked;
        }

        let slice = (ranked.len() as f64 * self.config.dense_top_fraction).ceil() as usize;
        let take = slice.max(self.config.forward_set_floor);
        ranked.into_iter().take(take).collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
