//! Synchronous multi-node simulations
//!
//! Exercises the relay, routing, and dedup layers together by wiring many
//! in-memory nodes into a topology and pumping frames between them until the
//! mesh goes quiet. No runtime, no clocks: every exchange is deterministic.

use std::collections::VecDeque;
use std::sync::Arc;

use meshrelay_core::channel::{Effect, Notification};
use meshrelay_core::config::{DedupConfig, RelayConfig, RoutingConfig};
use meshrelay_core::crypto::DalekCrypto;
use meshrelay_core::dedup::DeduplicationManager;
use meshrelay_core::persistence::{MemoryStore, PersistenceAdapter};
use meshrelay_core::relay::MessageRelay;
use meshrelay_core::routing::{ConnectionState, RoutingTable};
use meshrelay_core::types::{ManualTimeSource, PeerId, Priority, TransportKind};

struct SimNode {
    id: PeerId,
    relay: MessageRelay<ManualTimeSource>,
    routing: RoutingTable<ManualTimeSource>,
    dedup: DeduplicationManager<ManualTimeSource>,
    received: Vec<Vec<u8>>,
    delivered_ids: Vec<meshrelay_core::types::MessageId>,
}

impl SimNode {
    fn new() -> Self {
        let clock = ManualTimeSource::new(1_000_000);
        let (private, public) = DalekCrypto::generate_keypair();
        let id = PeerId::new(public);
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryStore::new());
        Self {
            id,
            relay: MessageRelay::new(
                RelayConfig::default(),
                id,
                private,
                Arc::new(DalekCrypto::new()),
                Arc::clone(&store),
                clock.clone(),
            )
            .unwrap(),
            routing: RoutingTable::new(id, RoutingConfig::default(), clock.clone()),
            dedup: DeduplicationManager::new(DedupConfig::default(), store, clock).unwrap(),
            received: Vec::new(),
            delivered_ids: Vec::new(),
        }
    }
}

struct Mesh {
    nodes: Vec<SimNode>,
}

impl Mesh {
    fn new(count: usize) -> Self {
        Self {
            nodes: (0..count).map(|_| SimNode::new()).collect(),
        }
    }

    /// Symmetric link between two nodes
    fn link(&mut self, a: usize, b: usize, quality: f64) {
        let id_a = self.nodes[a].id;
        let id_b = self.nodes[b].id;
        self.nodes[a].routing.apply_link_update(
            id_b,
            TransportKind::WebRtc,
            ConnectionState::Connected,
            quality,
            (100.0 - quality) * 10.0,
        );
        self.nodes[b].routing.apply_link_update(
            id_a,
            TransportKind::WebRtc,
            ConnectionState::Connected,
            quality,
            (100.0 - quality) * 10.0,
        );
    }

    fn index_of(&self, id: PeerId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    /// Pump frames until the mesh goes quiet, recording deliveries
    fn pump(&mut self, mut queue: VecDeque<(PeerId, PeerId, Vec<u8>)>) {
        // Generous bound: a runaway flood means a dedup bug
        let mut budget = 100_000usize;
        while let Some((from, to, bytes)) = queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "mesh never went quiet, flood is looping");

            let Some(target) = self.index_of(to) else { continue };
            let node = &mut self.nodes[target];
            let (_, effects) = node
                .relay
                .handle_incoming(&mut node.routing, &mut node.dedup, from, &bytes)
                .unwrap();
            let node_id = node.id;
            for effect in effects {
                match effect {
                    Effect::SendFrame { to: next, bytes } => {
                        queue.push_back((node_id, next, bytes));
                    }
                    Effect::Notify(Notification::MessageReceived { message }) => {
                        self.nodes[target].received.push(message.body.clone());
                    }
                    Effect::Notify(Notification::MessageDelivered { message_id, .. }) => {
                        self.nodes[target].delivered_ids.push(message_id);
                    }
                    Effect::Notify(_) => {}
                }
            }
        }
    }

    /// Originate a message at one node and pump the resulting flood
    fn send_from(&mut self, origin: usize, destination: Option<PeerId>, body: &[u8]) {
        let node = &mut self.nodes[origin];
        let (_, effects) = node
            .relay
            .send_message(
                &node.routing,
                &mut node.dedup,
                destination,
                body.to_vec(),
                Priority::Normal,
            )
            .unwrap();
        let origin_id = node.id;

        let mut queue = VecDeque::new();
        for effect in effects {
            if let Effect::SendFrame { to, bytes } = effect {
                queue.push_back((origin_id, to, bytes));
            }
        }
        self.pump(queue);
    }
}

/// Circulant topology: every node links to neighbors at the given offsets.
/// With offsets {1, 5, 11} a 30-node mesh has diameter well under the
/// default relay budget of 7 hops.
fn circulant(count: usize, offsets: &[usize]) -> Mesh {
    let mut mesh = Mesh::new(count);
    for i in 0..count {
        for offset in offsets {
            mesh.link(i, (i + offset) % count, 80.0);
        }
    }
    mesh
}

#[test]
fn broadcast_reaches_whole_mesh() {
    let mut mesh = circulant(30, &[1, 5, 11]);
    mesh.send_from(0, None, b"assembly at dawn");

    let reached = mesh
        .nodes
        .iter()
        .skip(1)
        .filter(|node| node.received.iter().any(|body| body == b"assembly at dawn"))
        .count();
    // 29 other nodes; require at least 95% coverage
    assert!(reached >= 28, "only {reached}/29 nodes reached");
}

#[test]
fn broadcast_delivered_exactly_once_per_node() {
    let mut mesh = circulant(20, &[1, 3, 7]);
    mesh.send_from(0, None, b"once only");

    for node in mesh.nodes.iter().skip(1) {
        let copies = node
            .received
            .iter()
            .filter(|body| body.as_slice() == b"once only")
            .count();
        assert!(copies <= 1, "node {} saw {copies} copies", node.id);
    }
}

#[test]
fn directed_delivery_converges_across_the_mesh() {
    let mut mesh = circulant(30, &[1, 5, 11]);

    // One directed message per node, each aimed at the peer 13 positions
    // away, the farthest offset in this topology
    let mut delivered = 0usize;
    for origin in 0..30 {
        let target = (origin + 13) % 30;
        let dest = mesh.nodes[target].id;
        let body = format!("dispatch {origin}");
        mesh.send_from(origin, Some(dest), body.as_bytes());

        if mesh.nodes[target]
            .received
            .iter()
            .any(|received| received == body.as_bytes())
        {
            delivered += 1;
        }
    }
    // Require at least 95% of pairs to converge within the 7-hop budget
    assert!(delivered >= 29, "only {delivered}/30 pairs delivered");
}

#[test]
fn directed_message_crosses_multiple_hops() {
    // A line: 0 - 1 - 2 - 3 - 4, destination four hops out
    let mut mesh = Mesh::new(5);
    for i in 0..4 {
        mesh.link(i, i + 1, 90.0);
    }
    let dest = mesh.nodes[4].id;
    mesh.send_from(0, Some(dest), b"four hops");

    assert!(mesh.nodes[4]
        .received
        .iter()
        .any(|body| body == b"four hops"));
    // The ack made it back and cleared the origin's stored copy
    assert_eq!(mesh.nodes[0].delivered_ids.len(), 1);
    assert_eq!(mesh.nodes[0].relay.stored_len(), 0);
}

#[test]
fn relay_budget_limits_reach() {
    // A line longer than the default TTL of 7
    let mut mesh = Mesh::new(12);
    for i in 0..11 {
        mesh.link(i, i + 1, 90.0);
    }
    let dest = mesh.nodes[11].id;
    mesh.send_from(0, Some(dest), b"too far");

    assert!(mesh.nodes[11].received.is_empty());
    // Intermediate couriers hold copies for a future path or sync
    assert!(mesh.nodes[5].relay.stored_len() > 0);
}
