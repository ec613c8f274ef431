//! Property tests over the wire codec and the dedup tiers

use std::sync::Arc;

use proptest::prelude::*;

use meshrelay_core::config::DedupConfig;
use meshrelay_core::dedup::{BloomFilter, DeduplicationManager};
use meshrelay_core::message::{Message, MessageType};
use meshrelay_core::persistence::MemoryStore;
use meshrelay_core::types::{ManualTimeSource, MessageId, PeerId, Priority, Timestamp, Ttl};

fn message_id(n: u64) -> MessageId {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    MessageId::from_bytes(bytes)
}

proptest! {
    /// Decoding must never panic, whatever bytes arrive off the wire
    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = Message::decode(&bytes);
    }

    /// The message ID ignores the per-hop mutable fields, so every relay
    /// along a path agrees on the dedup key
    #[test]
    fn id_ignores_per_hop_fields(
        body in proptest::collection::vec(any::<u8>(), 0..128),
        ttl in 0u8..=255,
        hops in 0u8..=255,
        timestamp in any::<u64>(),
    ) {
        let original = Message::new(MessageType::Data, PeerId::from_bytes(&[1]), body)
            .with_timestamp(Timestamp::new(timestamp));
        let id = original.id();

        let mut hopped = original;
        hopped.header.ttl = Ttl::new(ttl);
        hopped.header.hop_count = hops;
        prop_assert_eq!(hopped.id(), id);
    }

    /// The ID is content-derived: different body or sender, different ID
    #[test]
    fn id_tracks_content(
        body_a in proptest::collection::vec(any::<u8>(), 1..64),
        body_b in proptest::collection::vec(any::<u8>(), 1..64),
    ) {
        let a = Message::new(MessageType::Data, PeerId::from_bytes(&[1]), body_a.clone())
            .with_timestamp(Timestamp::new(7));
        let b = Message::new(MessageType::Data, PeerId::from_bytes(&[1]), body_b.clone())
            .with_timestamp(Timestamp::new(7));
        prop_assert_eq!(a.id() == b.id(), body_a == body_b);
    }

    /// Two-tier dedup never reports a marked ID as new, and never flags an
    /// unmarked ID as duplicate, regardless of interleaving
    #[test]
    fn dedup_exactness(ops in proptest::collection::vec((0u64..200, any::<bool>()), 1..100)) {
        let mut dedup = DeduplicationManager::new(
            DedupConfig::default(),
            Arc::new(MemoryStore::new()),
            ManualTimeSource::new(0),
        )
        .unwrap();

        let mut marked = std::collections::HashSet::new();
        for (n, mark) in ops {
            let id = message_id(n);
            if mark {
                dedup.mark_seen(&id).unwrap();
                marked.insert(n);
            } else {
                prop_assert_eq!(dedup.should_process(&id).unwrap(), !marked.contains(&n));
            }
        }
    }

    /// Eviction order respects priority classes: encoding preserves priority
    /// so the courier on the far side ranks the copy identically
    #[test]
    fn priority_survives_the_wire(priority in 0u8..4) {
        let priority = Priority::from_u8(priority).unwrap();
        let msg = Message::new(MessageType::Data, PeerId::from_bytes(&[2]), vec![1, 2, 3])
            .with_priority(priority);
        let decoded = Message::decode(&msg.encode()).unwrap();
        prop_assert_eq!(decoded.header.priority, priority);
    }
}

/// With the filter sized for 100k entries at 1%, a 10k load stays well
/// under the target false positive rate
#[test]
fn bloom_false_positive_rate_within_bound() {
    let mut filter = BloomFilter::for_capacity(100_000, 0.01, 7);
    for n in 0..10_000u64 {
        filter.add(&message_id(n));
    }

    let false_positives = (100_000..110_000u64)
        .filter(|n| filter.contains(&message_id(*n)))
        .count();
    // Filter is under-loaded, so observed FP rate should sit far below 1%
    assert!(
        false_positives < 100,
        "false positive rate too high: {false_positives}/10000"
    );
}

/// A Bloom false positive must not suppress a genuinely new message
#[test]
fn bloom_hit_is_confirmed_against_log() {
    // A tiny filter saturates quickly, making false positives certain
    let config = DedupConfig {
        expected_messages: 4,
        false_positive_rate: 0.5,
        hash_functions: 2,
        ..DedupConfig::default()
    };
    let mut dedup = DeduplicationManager::new(
        config,
        Arc::new(MemoryStore::new()),
        ManualTimeSource::new(0),
    )
    .unwrap();

    for n in 0..50 {
        dedup.mark_seen(&message_id(n)).unwrap();
    }
    // The saturated filter says "maybe" for everything, but the log keeps
    // unmarked IDs processable
    for n in 1_000..1_050 {
        assert!(dedup.should_process(&message_id(n)).unwrap());
    }
    assert!(dedup.stats().bloom_false_positives > 0);
}
