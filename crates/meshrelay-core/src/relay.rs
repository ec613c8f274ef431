//! Store-and-forward message relay
//!
//! The relay is the heart of the engine: it validates incoming frames,
//! deduplicates them, delivers messages addressed to this node, forwards the
//! rest along the routing table's forward set, and keeps undelivered copies
//! at rest so partitions heal when connectivity returns.
//!
//! The relay performs no I/O of its own. Every network side effect is
//! returned as an [`Effect`] for the transport layer, and every disk write
//! goes through the persistence adapter. Stored copies survive restarts; a
//! copy is deleted only by a destination acknowledgment, retention expiry, or
//! quota eviction.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::channel::{Effect, Notification};
use crate::config::RelayConfig;
use crate::crypto::CryptoProvider;
use crate::dedup::DeduplicationManager;
use crate::message::{DeliveryAck, Message, MessageType};
use crate::persistence::PersistenceAdapter;
use crate::routing::RoutingTable;
use crate::types::{MessageId, PeerId, Priority, TimeSource, Timestamp, Ttl};
use crate::{MeshError, Result};

/// Storage key prefix for at-rest message copies
const STORE_PREFIX: &str = "msg/";

/// Cap on the exponential retry backoff exponent
const MAX_BACKOFF_EXPONENT: u32 = 5;

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Why an incoming frame was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame failed to decode
    DecodeFailed,
    /// Signature did not verify under the sender's key
    BadSignature,
    /// Relay budget exhausted before reaching a destination
    TtlExhausted,
    /// Message type the relay does not own
    UnhandledType,
}

/// Result of processing one incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Message was addressed to this node and surfaced to the application
    DeliveredLocal,
    /// Message was forwarded to this many peers (and stored)
    Forwarded { peers: usize },
    /// No usable next hop right now; the copy is stored for retry
    StoredOnly,
    /// Message was already seen and skipped
    Duplicate,
    /// A delivery acknowledgment was consumed
    AckProcessed,
    /// Frame was discarded
    Dropped(DropReason),
}

// ----------------------------------------------------------------------------
// Stored Records
// ----------------------------------------------------------------------------

/// Persisted at-rest copy of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    /// Full wire encoding of the message
    bytes: Vec<u8>,
    stored_at: Timestamp,
    /// Locally originated messages are never quota-evicted
    local_origin: bool,
}

/// In-memory index entry for one stored message
#[derive(Debug, Clone)]
struct StoredMeta {
    priority: Priority,
    destination: Option<PeerId>,
    stored_at: Timestamp,
    size: usize,
    local_origin: bool,
    attempts: u32,
    last_attempt: Option<Timestamp>,
}

/// Counters for relay behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    pub delivered_local: u64,
    pub forwarded: u64,
    pub stored_only: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub acks_processed: u64,
    pub evicted: u64,
}

// ----------------------------------------------------------------------------
// Message Relay
// ----------------------------------------------------------------------------

/// Store-and-forward relay for one mesh node
pub struct MessageRelay<T: TimeSource> {
    local_id: PeerId,
    private_key: [u8; 32],
    config: RelayConfig,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn PersistenceAdapter>,
    index: HashMap<MessageId, StoredMeta>,
    bytes_used: usize,
    time_source: T,
    stats: RelayStats,
}

impl<T: TimeSource> MessageRelay<T> {
    /// Create a relay and rebuild the in-memory index from persisted copies
    pub fn new(
        config: RelayConfig,
        local_id: PeerId,
        private_key: [u8; 32],
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn PersistenceAdapter>,
        time_source: T,
    ) -> Result<Self> {
        let mut relay = Self {
            local_id,
            private_key,
            config,
            crypto,
            store,
            index: HashMap::new(),
            bytes_used: 0,
            time_source,
            stats: RelayStats::default(),
        };
        relay.load_index()?;
        Ok(relay)
    }

    fn store_key(id: &MessageId) -> String {
        format!("{STORE_PREFIX}{}", id.to_hex())
    }

    /// Rebuild the index by replaying persisted records
    fn load_index(&mut self) -> Result<()> {
        for (key, value) in self.store.query_by_prefix(STORE_PREFIX)? {
            let record: StoredRecord = match bincode::deserialize(&value) {
                Ok(record) => record,
                Err(_) => {
                    tracing::warn!(%key, "unreadable stored record, dropping");
                    self.store.delete(&key)?;
                    continue;
                }
            };
            let message = match Message::decode(&record.bytes) {
                Ok(message) => message,
                Err(_) => {
                    self.store.delete(&key)?;
                    continue;
                }
            };
            let size = value.len();
            self.bytes_used += size;
            self.index.insert(
                message.id(),
                StoredMeta {
                    priority: message.header.priority,
                    destination: message.destination,
                    stored_at: record.stored_at,
                    size,
                    local_origin: record.local_origin,
                    attempts: 0,
                    last_attempt: None,
                },
            );
        }
        tracing::debug!(
            stored = self.index.len(),
            bytes = self.bytes_used,
            "rebuilt relay index from store"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Originate a message from this node.
    ///
    /// The message is signed, marked seen (so the mesh echo is suppressed),
    /// stored at rest, and flooded to the forward set. With no reachable
    /// peers the message simply waits for the retry loop.
    pub fn send_message(
        &mut self,
        routing: &RoutingTable<T>,
        dedup: &mut DeduplicationManager<T>,
        destination: Option<PeerId>,
        body: Vec<u8>,
        priority: Priority,
    ) -> Result<(MessageId, Vec<Effect>)> {
        let mut message = Message::new(MessageType::Data, self.local_id, body)
            .with_priority(priority)
            .with_ttl(Ttl::new(self.config.default_ttl))
            .with_timestamp(self.time_source.now());
        if let Some(dest) = destination {
            message = message.with_destination(dest);
        }
        message.sign(self.crypto.as_ref(), &self.private_key)?;

        let id = message.id();
        dedup.mark_seen(&id)?;
        self.store_message(&message, true)?;

        let mut effects = Vec::new();
        let targets = routing.select_forward_set(destination.as_ref(), &[]);
        if !targets.is_empty() {
            let bytes = message.encode();
            self.note_attempt(&id);
            for peer in &targets {
                effects.push(Effect::SendFrame {
                    to: *peer,
                    bytes: bytes.clone(),
                });
            }
        }
        tracing::debug!(%id, peers = targets.len(), "originated message");
        Ok((id, effects))
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Process one frame received from a directly connected peer
    pub fn handle_incoming(
        &mut self,
        routing: &mut RoutingTable<T>,
        dedup: &mut DeduplicationManager<T>,
        from: PeerId,
        bytes: &[u8],
    ) -> Result<(RelayOutcome, Vec<Effect>)> {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%from, %err, "dropping undecodable frame");
                self.stats.dropped += 1;
                return Ok((RelayOutcome::Dropped(DropReason::DecodeFailed), vec![]));
            }
        };

        if !matches!(
            message.header.msg_type,
            MessageType::Data | MessageType::DeliveryAck | MessageType::Announce
        ) {
            self.stats.dropped += 1;
            return Ok((RelayOutcome::Dropped(DropReason::UnhandledType), vec![]));
        }

        if !message.verify(self.crypto.as_ref()) {
            tracing::debug!(%from, sender = %message.header.sender_id, "bad signature");
            self.stats.dropped += 1;
            return Ok((RelayOutcome::Dropped(DropReason::BadSignature), vec![]));
        }

        let id = message.id();
        if !dedup.should_process(&id)? {
            self.stats.duplicates += 1;
            return Ok((RelayOutcome::Duplicate, vec![]));
        }
        dedup.mark_seen(&id)?;

        // Seeing sender S via neighbor F teaches the reverse route
        if message.header.sender_id != from {
            routing.update_route(message.header.sender_id, from);
        }

        if message.header.msg_type == MessageType::DeliveryAck {
            return self.handle_ack(routing, from, message);
        }
        self.handle_data(routing, from, message, id)
    }

    fn handle_data(
        &mut self,
        routing: &RoutingTable<T>,
        from: PeerId,
        message: Message,
        id: MessageId,
    ) -> Result<(RelayOutcome, Vec<Effect>)> {
        let mut effects = Vec::new();

        // Addressed to us: surface and acknowledge
        if message.destination == Some(self.local_id) {
            let sender = message.header.sender_id;
            effects.push(Effect::Notify(Notification::MessageReceived { message }));
            effects.extend(self.emit_ack(routing, id, sender)?);
            self.stats.delivered_local += 1;
            return Ok((RelayOutcome::DeliveredLocal, effects));
        }

        // Broadcasts are delivered locally *and* forwarded
        let delivered_broadcast = message.is_broadcast();
        if delivered_broadcast {
            effects.push(Effect::Notify(Notification::MessageReceived {
                message: message.clone(),
            }));
        }

        match message.header.ttl.decrement() {
            Some(ttl) => {
                let mut onward = message;
                onward.header.ttl = ttl;
                onward.header.hop_count = onward.header.hop_count.saturating_add(1);
                self.store_relayed(&onward);

                let (count, frames) = self.forward(routing, &onward, &id, &[from]);
                effects.extend(frames);
                let outcome = if count > 0 {
                    self.stats.forwarded += 1;
                    RelayOutcome::Forwarded { peers: count }
                } else if delivered_broadcast {
                    self.stats.delivered_local += 1;
                    RelayOutcome::DeliveredLocal
                } else {
                    self.stats.stored_only += 1;
                    RelayOutcome::StoredOnly
                };
                Ok((outcome, effects))
            }
            None if delivered_broadcast => {
                // Broadcast that reached us on its last hop: delivered, not
                // forwarded
                self.stats.delivered_local += 1;
                Ok((RelayOutcome::DeliveredLocal, effects))
            }
            None => {
                self.stats.dropped += 1;
                Ok((RelayOutcome::Dropped(DropReason::TtlExhausted), effects))
            }
        }
    }

    fn handle_ack(
        &mut self,
        routing: &RoutingTable<T>,
        from: PeerId,
        message: Message,
    ) -> Result<(RelayOutcome, Vec<Effect>)> {
        let ack: DeliveryAck = bincode::deserialize(&message.body)?;
        let mut effects = Vec::new();

        // Only the stored copy's own destination can confirm delivery; an
        // ack signed by anyone else leaves the at-rest copy in place
        let confirmed = self
            .index
            .get(&ack.message_id)
            .is_some_and(|meta| meta.destination == Some(message.header.sender_id));
        let held_copy = if confirmed {
            self.remove_stored(&ack.message_id)?
        } else {
            if self.index.contains_key(&ack.message_id) {
                tracing::warn!(id = %ack.message_id, signer = %message.header.sender_id,
                    "ack signer is not the destination, keeping stored copy");
            }
            false
        };

        if message.destination == Some(self.local_id) {
            if held_copy {
                effects.push(Effect::Notify(Notification::MessageDelivered {
                    message_id: ack.message_id,
                    acked_at: ack.timestamp,
                }));
            }
            self.stats.acks_processed += 1;
            return Ok((RelayOutcome::AckProcessed, effects));
        }

        // Relay the ack back toward the original sender
        if let Some(ttl) = message.header.ttl.decrement() {
            let mut onward = message;
            onward.header.ttl = ttl;
            onward.header.hop_count = onward.header.hop_count.saturating_add(1);
            let onward_id = onward.id();
            self.store_relayed(&onward);
            let (_, frames) = self.forward(routing, &onward, &onward_id, &[from]);
            effects.extend(frames);
        }
        self.stats.acks_processed += 1;
        Ok((RelayOutcome::AckProcessed, effects))
    }

    /// Build, sign, store, and flood a delivery acknowledgment
    fn emit_ack(
        &mut self,
        routing: &RoutingTable<T>,
        acked: MessageId,
        sender: PeerId,
    ) -> Result<Vec<Effect>> {
        let now = self.time_source.now();
        let body = bincode::serialize(&DeliveryAck::new(acked, now))?;
        let mut ack = Message::new(MessageType::DeliveryAck, self.local_id, body)
            .with_destination(sender)
            .with_priority(Priority::High)
            .with_ttl(Ttl::new(self.config.default_ttl))
            .with_timestamp(now);
        ack.sign(self.crypto.as_ref(), &self.private_key)?;

        let id = ack.id();
        self.store_relayed(&ack);
        let (_, frames) = self.forward(routing, &ack, &id, &[]);
        Ok(frames)
    }

    /// Build frames for the forward set, excluding the arrival hop and the
    /// original sender
    fn forward(
        &mut self,
        routing: &RoutingTable<T>,
        message: &Message,
        id: &MessageId,
        exclude: &[PeerId],
    ) -> (usize, Vec<Effect>) {
        let mut exclude: Vec<PeerId> = exclude.to_vec();
        exclude.push(message.header.sender_id);

        let targets = routing.select_forward_set(message.destination.as_ref(), &exclude);
        if targets.is_empty() {
            return (0, vec![]);
        }
        self.note_attempt(id);
        let bytes = message.encode();
        let frames = targets
            .iter()
            .map(|peer| Effect::SendFrame {
                to: *peer,
                bytes: bytes.clone(),
            })
            .collect();
        (targets.len(), frames)
    }

    // ------------------------------------------------------------------------
    // Retry Loop
    // ------------------------------------------------------------------------

    /// One pass over stored messages: purge expired copies, then retry
    /// delivery for destinations that are reachable again. Retries back off
    /// exponentially per message.
    pub fn retry_tick(&mut self, routing: &RoutingTable<T>) -> Result<Vec<Effect>> {
        let now = self.time_source.now();

        // Retention expiry first
        let expired: Vec<MessageId> = self
            .index
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.stored_at) > meta.priority.retention())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove_stored(id)?;
            tracing::debug!(%id, "retention expired, purged stored copy");
        }

        let mut effects = Vec::new();
        let candidates: Vec<(MessageId, Option<PeerId>)> = self
            .index
            .iter()
            .filter(|(_, meta)| Self::backoff_elapsed(meta, now, &self.config))
            .map(|(id, meta)| (*id, meta.destination))
            .collect();

        for (id, destination) in candidates {
            let message = match self.load_message(&id)? {
                Some(message) => message,
                None => continue,
            };

            let targets = match destination {
                // Direct link restored: send straight to the destination
                Some(dest) if routing.is_directly_connected(&dest) => vec![dest],
                // Otherwise re-flood along the current forward set
                _ => routing.select_forward_set(destination.as_ref(), &[]),
            };
            if targets.is_empty() {
                continue;
            }

            self.note_attempt(&id);
            let bytes = message.encode();
            for peer in targets {
                effects.push(Effect::SendFrame {
                    to: peer,
                    bytes: bytes.clone(),
                });
            }
        }
        Ok(effects)
    }

    fn backoff_elapsed(meta: &StoredMeta, now: Timestamp, config: &RelayConfig) -> bool {
        match meta.last_attempt {
            None => true,
            Some(last) => {
                let exponent = meta.attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                let wait = config.retry_interval * 2u32.pow(exponent);
                now.duration_since(last) >= wait
            }
        }
    }

    fn note_attempt(&mut self, id: &MessageId) {
        let now = self.time_source.now();
        if let Some(meta) = self.index.get_mut(id) {
            meta.attempts += 1;
            meta.last_attempt = Some(now);
        }
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    /// Store a relayed copy. Quota failure is non-fatal here: the message
    /// still gets forwarded, it just is not kept at rest.
    fn store_relayed(&mut self, message: &Message) {
        if let Err(err) = self.store_message(message, false) {
            tracing::warn!(%err, "could not store relayed copy");
        }
    }

    /// Persist a message copy, evicting lower-value copies if needed
    fn store_message(&mut self, message: &Message, local_origin: bool) -> Result<()> {
        let id = message.id();
        if self.index.contains_key(&id) {
            return Ok(());
        }

        let now = self.time_source.now();
        let record = StoredRecord {
            bytes: message.encode(),
            stored_at: now,
            local_origin,
        };
        let value = bincode::serialize(&record)?;

        self.ensure_budget(value.len())?;
        self.store.put(&Self::store_key(&id), &value)?;
        self.bytes_used += value.len();
        self.index.insert(
            id,
            StoredMeta {
                priority: message.header.priority,
                destination: message.destination,
                stored_at: now,
                size: value.len(),
                local_origin,
                attempts: 0,
                last_attempt: None,
            },
        );
        Ok(())
    }

    /// Free budget for an incoming copy. Eviction order: retention-expired
    /// copies, then relayed copies Low to High, oldest first within a class.
    /// Emergency copies are evictable only past the critical fill ratio, and
    /// locally originated copies never are.
    fn ensure_budget(&mut self, needed: usize) -> Result<()> {
        let budget = self.config.storage_budget_bytes;
        if needed > budget {
            return Err(MeshError::Quota { needed, budget });
        }
        if self.bytes_used + needed <= budget {
            return Ok(());
        }

        let now = self.time_source.now();
        let expired: Vec<MessageId> = self
            .index
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.stored_at) > meta.priority.retention())
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.remove_stored(&id)?;
            self.stats.evicted += 1;
            if self.bytes_used + needed <= budget {
                return Ok(());
            }
        }

        let critical = self.bytes_used as f64 / budget as f64 >= self.config.critical_fill_ratio;
        let mut evictable: Vec<(MessageId, Priority, Timestamp)> = self
            .index
            .iter()
            .filter(|(_, meta)| {
                !meta.local_origin && (meta.priority < Priority::Emergency || critical)
            })
            .map(|(id, meta)| (*id, meta.priority, meta.stored_at))
            .collect();
        evictable.sort_by_key(|(_, priority, stored_at)| (*priority, *stored_at));

        for (id, _, _) in evictable {
            self.remove_stored(&id)?;
            self.stats.evicted += 1;
            if self.bytes_used + needed <= budget {
                return Ok(());
            }
        }
        Err(MeshError::Quota { needed, budget })
    }

    /// Delete a stored copy, returning whether one existed
    pub fn remove_stored(&mut self, id: &MessageId) -> Result<bool> {
        match self.index.remove(id) {
            Some(meta) => {
                self.bytes_used = self.bytes_used.saturating_sub(meta.size);
                self.store.delete(&Self::store_key(id))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load the full message for a stored ID
    pub fn load_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let Some(value) = self.store.get(&Self::store_key(id))? else {
            return Ok(None);
        };
        let record: StoredRecord = bincode::deserialize(&value)?;
        Ok(Some(Message::decode(&record.bytes)?))
    }

    /// IDs of all stored copies (the courier sync inventory)
    pub fn stored_ids(&self) -> Vec<MessageId> {
        self.index.keys().copied().collect()
    }

    /// Stored copies ordered for courier transfer: highest priority first,
    /// oldest first within a class
    pub fn stored_ids_by_priority(&self) -> Vec<MessageId> {
        let mut entries: Vec<(MessageId, Priority, Timestamp)> = self
            .index
            .iter()
            .map(|(id, meta)| (*id, meta.priority, meta.stored_at))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
        entries.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Number of stored copies
    pub fn stored_len(&self) -> usize {
        self.index.len()
    }

    /// Bytes of at-rest storage in use
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Snapshot of relay counters
    pub fn stats(&self) -> RelayStats {
        self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, RoutingConfig};
    use crate::crypto::DalekCrypto;
    use crate::persistence::MemoryStore;
    use crate::routing::ConnectionState;
    use crate::types::{ManualTimeSource, TransportKind};
    use core::time::Duration;

    struct Node {
        id: PeerId,
        relay: MessageRelay<ManualTimeSource>,
        routing: RoutingTable<ManualTimeSource>,
        dedup: DeduplicationManager<ManualTimeSource>,
        clock: ManualTimeSource,
    }

    impl Node {
        fn new() -> Self {
            Self::with_config(RelayConfig::default())
        }

        fn with_config(config: RelayConfig) -> Self {
            let clock = ManualTimeSource::new(1_000_000);
            let (private, public) = DalekCrypto::generate_keypair();
            let id = PeerId::new(public);
            let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryStore::new());
            let relay = MessageRelay::new(
                config,
                id,
                private,
                Arc::new(DalekCrypto::new()),
                Arc::clone(&store),
                clock.clone(),
            )
            .unwrap();
            let routing = RoutingTable::new(id, RoutingConfig::default(), clock.clone());
            let dedup =
                DeduplicationManager::new(DedupConfig::default(), store, clock.clone()).unwrap();
            Self {
                id,
                relay,
                routing,
                dedup,
                clock,
            }
        }

        fn connect(&mut self, peer: PeerId) {
            self.routing.apply_link_update(
                peer,
                TransportKind::WebRtc,
                ConnectionState::Connected,
                80.0,
                200.0,
            );
        }

        fn handle(&mut self, from: PeerId, bytes: &[u8]) -> (RelayOutcome, Vec<Effect>) {
            self.relay
                .handle_incoming(&mut self.routing, &mut self.dedup, from, bytes)
                .unwrap()
        }
    }

    fn frames(effects: &[Effect]) -> Vec<(PeerId, Vec<u8>)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::SendFrame { to, bytes } => Some((*to, bytes.clone())),
                Effect::Notify(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_send_with_no_peers_stores_only() {
        let mut node = Node::new();
        let (id, effects) = node
            .relay
            .send_message(
                &node.routing,
                &mut node.dedup,
                Some(PeerId::from_bytes(&[9])),
                b"hello".to_vec(),
                Priority::Normal,
            )
            .unwrap();

        assert!(effects.is_empty());
        assert_eq!(node.relay.stored_len(), 1);
        assert!(node.relay.load_message(&id).unwrap().is_some());
    }

    #[test]
    fn test_delivery_and_ack_round_trip() {
        let mut alice = Node::new();
        let mut bob = Node::new();
        alice.connect(bob.id);
        bob.connect(alice.id);

        let (sent_id, effects) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(bob.id),
                b"hi bob".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        let sent = frames(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, bob.id);

        // Bob receives, surfaces it, and acks
        let (outcome, effects) = bob.handle(alice.id, &sent[0].1);
        assert_eq!(outcome, RelayOutcome::DeliveredLocal);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Notify(Notification::MessageReceived { .. })
        )));
        let ack_frames = frames(&effects);
        assert_eq!(ack_frames.len(), 1);

        // Alice consumes the ack and drops her stored copy
        assert_eq!(alice.relay.stored_len(), 1);
        let (outcome, effects) = alice.handle(bob.id, &ack_frames[0].1);
        assert_eq!(outcome, RelayOutcome::AckProcessed);
        assert_eq!(alice.relay.stored_len(), 0);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Notify(Notification::MessageDelivered { message_id, .. })
                if *message_id == sent_id
        )));
    }

    #[test]
    fn test_ack_from_wrong_peer_keeps_stored_copy() {
        let mut alice = Node::new();
        let (mallory_key, mallory_public) = DalekCrypto::generate_keypair();
        let mallory = PeerId::new(mallory_public);
        alice.connect(mallory);

        // A message for an offline peer sits at rest
        let bob_id = PeerId::from_bytes(&[7; 32]);
        let (sent_id, _) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(bob_id),
                b"for bob only".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        assert_eq!(alice.relay.stored_len(), 1);

        // A third peer signs an ack naming that message ID without ever
        // having been its destination
        let body =
            bincode::serialize(&DeliveryAck::new(sent_id, Timestamp::new(2_000_000))).unwrap();
        let mut forged = Message::new(MessageType::DeliveryAck, mallory, body)
            .with_destination(alice.id)
            .with_priority(Priority::High);
        forged.sign(&DalekCrypto::new(), &mallory_key).unwrap();

        let (outcome, effects) = alice.handle(mallory, &forged.encode());
        assert_eq!(outcome, RelayOutcome::AckProcessed);

        // The copy is still waiting for bob and no delivery was reported
        assert_eq!(alice.relay.stored_len(), 1);
        assert!(alice.relay.load_message(&sent_id).unwrap().is_some());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_duplicate_suppressed() {
        let mut alice = Node::new();
        let mut bob = Node::new();
        alice.connect(bob.id);

        let (_, effects) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                None,
                b"flood".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        let sent = frames(&effects);

        let (first, _) = bob.handle(alice.id, &sent[0].1);
        assert_ne!(first, RelayOutcome::Duplicate);
        let (second, effects) = bob.handle(alice.id, &sent[0].1);
        assert_eq!(second, RelayOutcome::Duplicate);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_ttl_exhaustion_drops() {
        let mut alice = Node::with_config(RelayConfig {
            default_ttl: 0,
            ..RelayConfig::default()
        });
        let mut bob = Node::new();
        alice.connect(bob.id);

        let (_, effects) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(PeerId::from_bytes(&[9])),
                b"doomed".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        let sent = frames(&effects);

        let (outcome, _) = bob.handle(alice.id, &sent[0].1);
        assert_eq!(outcome, RelayOutcome::Dropped(DropReason::TtlExhausted));
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let mut alice = Node::new();
        let mut bob = Node::new();
        alice.connect(bob.id);

        let (_, effects) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(bob.id),
                b"original".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        let mut bytes = frames(&effects)[0].1.clone();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let (outcome, effects) = bob.handle(alice.id, &bytes);
        assert_eq!(outcome, RelayOutcome::Dropped(DropReason::BadSignature));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_retry_after_reconnect() {
        let mut alice = Node::new();
        let bob_id = PeerId::from_bytes(&[7; 32]);

        // Bob is offline at send time
        let (_, effects) = alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(bob_id),
                b"later".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        assert!(effects.is_empty());

        // Bob comes online; the next retry pass sends directly
        alice.connect(bob_id);
        let effects = alice.relay.retry_tick(&alice.routing).unwrap();
        let sent = frames(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, bob_id);
    }

    #[test]
    fn test_retry_backs_off() {
        let mut alice = Node::new();
        let bob_id = PeerId::from_bytes(&[7; 32]);
        alice.connect(bob_id);

        alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(bob_id),
                b"x".to_vec(),
                Priority::Normal,
            )
            .unwrap();

        // Immediately after the send attempt, backoff suppresses the retry
        assert!(alice.relay.retry_tick(&alice.routing).unwrap().is_empty());

        alice.clock.advance(Duration::from_secs(11));
        assert_eq!(alice.relay.retry_tick(&alice.routing).unwrap().len(), 1);
    }

    #[test]
    fn test_retention_expiry_purges() {
        let mut alice = Node::new();
        alice
            .relay
            .send_message(
                &alice.routing,
                &mut alice.dedup,
                Some(PeerId::from_bytes(&[9])),
                b"short lived".to_vec(),
                Priority::Low,
            )
            .unwrap();
        assert_eq!(alice.relay.stored_len(), 1);

        // Low priority retention is 24h
        alice.clock.advance(Duration::from_secs(25 * 60 * 60));
        alice.relay.retry_tick(&alice.routing).unwrap();
        assert_eq!(alice.relay.stored_len(), 0);
    }

    #[test]
    fn test_eviction_order_under_quota_pressure() {
        // Budget sized so each small relayed copy is ~162 bytes at rest and
        // the store holds a handful of them
        let mut courier = Node::with_config(RelayConfig {
            storage_budget_bytes: 900,
            ..RelayConfig::default()
        });
        let mut alice = Node::new();
        alice.connect(courier.id);

        let relayed =
            |courier: &mut Node, alice: &mut Node, priority: Priority, body: Vec<u8>| {
                let (id, effects) = alice
                    .relay
                    .send_message(
                        &alice.routing,
                        &mut alice.dedup,
                        Some(PeerId::from_bytes(&[99])),
                        body,
                        priority,
                    )
                    .unwrap();
                let sent = frames(&effects);
                courier.handle(alice.id, &sent[0].1);
                courier.clock.advance(Duration::from_millis(10));
                id
            };

        // The courier's own outbound copy, then one relayed copy per class
        let (own_id, _) = courier
            .relay
            .send_message(
                &courier.routing,
                &mut courier.dedup,
                Some(PeerId::from_bytes(&[0x77])),
                b"mine".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        courier.clock.advance(Duration::from_millis(10));

        let low = relayed(&mut courier, &mut alice, Priority::Low, b"aaa".to_vec());
        let normal = relayed(&mut courier, &mut alice, Priority::Normal, b"bbb".to_vec());
        let high = relayed(&mut courier, &mut alice, Priority::High, b"ccc".to_vec());
        let emergency = relayed(&mut courier, &mut alice, Priority::Emergency, b"ddd".to_vec());
        assert_eq!(courier.relay.stored_len(), 5);

        // First overflow takes the Low copy and nothing else
        let normal2 = relayed(&mut courier, &mut alice, Priority::Normal, vec![0u8; 20]);
        assert!(courier.relay.load_message(&low).unwrap().is_none());
        assert!(courier.relay.load_message(&normal).unwrap().is_some());
        assert!(courier.relay.load_message(&high).unwrap().is_some());
        assert_eq!(courier.relay.stats().evicted, 1);

        // With no Low copies left, Normals go oldest-first
        let low2 = relayed(&mut courier, &mut alice, Priority::Low, vec![1u8; 150]);
        assert!(courier.relay.load_message(&normal).unwrap().is_none());
        assert!(courier.relay.load_message(&normal2).unwrap().is_none());
        assert!(courier.relay.load_message(&high).unwrap().is_some());
        assert_eq!(courier.relay.stats().evicted, 3);

        // Then High, while Emergency is untouchable below the critical mark
        let normal3 = relayed(&mut courier, &mut alice, Priority::Normal, vec![2u8; 330]);
        assert!(courier.relay.load_message(&low2).unwrap().is_none());
        assert!(courier.relay.load_message(&high).unwrap().is_none());
        assert!(courier.relay.load_message(&emergency).unwrap().is_some());
        assert!(courier.relay.load_message(&normal3).unwrap().is_some());
        assert_eq!(courier.relay.stats().evicted, 5);

        // A copy too big to ever fit is refused rather than displacing the
        // Emergency copy or the courier's own message
        let oversized = relayed(&mut courier, &mut alice, Priority::High, vec![3u8; 600]);
        assert!(courier.relay.load_message(&oversized).unwrap().is_none());
        assert!(courier.relay.load_message(&emergency).unwrap().is_some());
        assert!(courier.relay.load_message(&own_id).unwrap().is_some());
        assert_eq!(courier.relay.stored_len(), 2);
    }

    #[test]
    fn test_index_rebuild_after_restart() {
        let clock = ManualTimeSource::new(1_000_000);
        let (private, public) = DalekCrypto::generate_keypair();
        let id = PeerId::new(public);
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryStore::new());

        let mut relay = MessageRelay::new(
            RelayConfig::default(),
            id,
            private,
            Arc::new(DalekCrypto::new()),
            Arc::clone(&store),
            clock.clone(),
        )
        .unwrap();
        let routing = RoutingTable::new(id, RoutingConfig::default(), clock.clone());
        let mut dedup = DeduplicationManager::new(
            DedupConfig::default(),
            Arc::clone(&store),
            clock.clone(),
        )
        .unwrap();

        let (msg_id, _) = relay
            .send_message(
                &routing,
                &mut dedup,
                Some(PeerId::from_bytes(&[9])),
                b"persist me".to_vec(),
                Priority::Normal,
            )
            .unwrap();
        drop(relay);

        // Fresh relay over the same store finds the copy
        let rebuilt = MessageRelay::new(
            RelayConfig::default(),
            id,
            private,
            Arc::new(DalekCrypto::new()),
            store,
            clock,
        )
        .unwrap();
        assert_eq!(rebuilt.stored_len(), 1);
        assert!(rebuilt.load_message(&msg_id).unwrap().is_some());
    }
}
