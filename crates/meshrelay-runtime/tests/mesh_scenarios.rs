//! End-to-end scenarios over running nodes and in-memory links

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use meshrelay_core::channel::Notification;
use meshrelay_core::config::MeshConfig;
use meshrelay_core::persistence::MemoryStore;
use meshrelay_core::types::{PeerId, Priority, TransportKind};
use meshrelay_runtime::link::MemoryLink;
use meshrelay_runtime::runtime::{MeshHandle, MeshRuntime, NodeIdentity};

const WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    runtime: MeshRuntime,
    handle: MeshHandle,
    notifications: mpsc::Receiver<Notification>,
}

impl TestNode {
    fn start(config: MeshConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let mut runtime = MeshRuntime::new(
            config,
            NodeIdentity::generate(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let handle = runtime.handle();
        let notifications = runtime.take_notifications().unwrap();
        runtime.start().unwrap();
        Self {
            runtime,
            handle,
            notifications,
        }
    }

    fn peer_id(&self) -> PeerId {
        self.runtime.peer_id()
    }

    /// Wait for the first notification matching the predicate
    async fn expect(
        &mut self,
        mut predicate: impl FnMut(&Notification) -> bool,
    ) -> Notification {
        timeout(WAIT, async {
            loop {
                let notification = self
                    .notifications
                    .recv()
                    .await
                    .expect("notification channel closed");
                if predicate(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }
}

fn wire(a: &TestNode, b: &TestNode) {
    let (link_a, link_b) = MemoryLink::pair(a.peer_id(), b.peer_id(), TransportKind::Lan);
    a.runtime.attach_link(Box::new(link_a));
    b.runtime.attach_link(Box::new(link_b));
}

#[tokio::test]
async fn direct_delivery_with_ack() {
    let mut a = TestNode::start(MeshConfig::testing());
    let mut b = TestNode::start(MeshConfig::testing());
    wire(&a, &b);

    a.expect(|n| matches!(n, Notification::PeerConnected { .. }))
        .await;

    a.handle
        .send_message(Some(b.peer_id()), b"hello across".to_vec(), Priority::Normal)
        .await
        .unwrap();

    let received = b
        .expect(|n| matches!(n, Notification::MessageReceived { .. }))
        .await;
    if let Notification::MessageReceived { message } = received {
        assert_eq!(message.body, b"hello across");
        assert_eq!(message.header.sender_id, a.peer_id());
    }

    // Destination ack clears the sender's stored copy
    a.expect(|n| matches!(n, Notification::MessageDelivered { .. }))
        .await;

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn message_waits_for_peer_to_appear() {
    let mut a = TestNode::start(MeshConfig::testing());
    let mut b = TestNode::start(MeshConfig::testing());

    // Send while no link exists: the message sits at rest
    a.handle
        .send_message(Some(b.peer_id()), b"patience".to_vec(), Priority::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The link appears; the retry loop delivers without a resend call
    wire(&a, &b);
    let received = b
        .expect(|n| matches!(n, Notification::MessageReceived { .. }))
        .await;
    if let Notification::MessageReceived { message } = received {
        assert_eq!(message.body, b"patience");
    }
    a.expect(|n| matches!(n, Notification::MessageDelivered { .. }))
        .await;

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn broadcast_crosses_an_intermediate_hop() {
    let mut a = TestNode::start(MeshConfig::testing());
    let mut b = TestNode::start(MeshConfig::testing());
    let mut c = TestNode::start(MeshConfig::testing());

    // Line topology: a - b - c
    wire(&a, &b);
    wire(&b, &c);
    a.expect(|n| matches!(n, Notification::PeerConnected { .. }))
        .await;

    a.handle
        .send_message(None, b"to everyone".to_vec(), Priority::High)
        .await
        .unwrap();

    let received = c
        .expect(|n| matches!(n, Notification::MessageReceived { .. }))
        .await;
    if let Notification::MessageReceived { message } = received {
        assert_eq!(message.body, b"to everyone");
        assert_eq!(message.header.sender_id, a.peer_id());
        assert!(message.header.hop_count >= 1);
    }

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
    c.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn courier_sync_transfers_stored_messages() {
    // Long retry interval so only the sync moves the messages
    let mut quiet = MeshConfig::testing();
    quiet.relay.retry_interval = Duration::from_secs(600);

    let mut a = TestNode::start(quiet.clone());
    let mut b = TestNode::start(quiet);

    // Three messages for a peer nobody can reach
    let absent = PeerId::from_bytes(&[0xEE; 32]);
    for n in 0..3u8 {
        a.handle
            .send_message(Some(absent), vec![b'm', n], Priority::Normal)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    wire(&a, &b);
    a.expect(|n| matches!(n, Notification::PeerConnected { .. }))
        .await;

    a.handle.start_sync(b.peer_id()).await.unwrap();

    let done = a
        .expect(|n| matches!(n, Notification::SyncCompleted { .. }))
        .await;
    if let Notification::SyncCompleted { sent, received, .. } = done {
        assert_eq!(sent, 3);
        assert_eq!(received, 0);
    }
    let done_b = b
        .expect(|n| matches!(n, Notification::SyncCompleted { .. }))
        .await;
    if let Notification::SyncCompleted { sent, received, .. } = done_b {
        assert_eq!(sent, 0);
        assert_eq!(received, 3);
    }

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_sync_moves_nothing() {
    let mut quiet = MeshConfig::testing();
    quiet.relay.retry_interval = Duration::from_secs(600);

    let mut a = TestNode::start(quiet.clone());
    let mut b = TestNode::start(quiet);

    a.handle
        .send_message(
            Some(PeerId::from_bytes(&[0xEE; 32])),
            b"carry once".to_vec(),
            Priority::Emergency,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    wire(&a, &b);
    a.expect(|n| matches!(n, Notification::PeerConnected { .. }))
        .await;

    a.handle.start_sync(b.peer_id()).await.unwrap();
    a.expect(|n| matches!(n, Notification::SyncCompleted { .. }))
        .await;

    a.handle.start_sync(b.peer_id()).await.unwrap();
    let second = a
        .expect(|n| matches!(n, Notification::SyncCompleted { .. }))
        .await;
    if let Notification::SyncCompleted { sent, received, .. } = second {
        assert_eq!(sent, 0);
        assert_eq!(received, 0);
    }

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
}
