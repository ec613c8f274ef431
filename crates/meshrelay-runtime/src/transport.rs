//! Transport manager
//!
//! Owns every open link. Each attached [`TransportLink`] runs inside its own
//! supervisor task that pumps frames both ways, probes with heartbeats,
//! reports health changes to the logic task as [`Event::LinkUpdate`], and
//! re-dials through the [`LinkConnector`] with exponential backoff when the
//! link drops. After the attempt budget is spent the peer is terminally
//! disconnected and its routing record ages out on its own.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshrelay_core::channel::{Event, EventSender};
use meshrelay_core::config::TransportConfig;
use meshrelay_core::errors::TransportError;
use meshrelay_core::message::{Message, MessageType};
use meshrelay_core::routing::ConnectionState;
use meshrelay_core::types::{PeerId, Timestamp, TransportKind};

use crate::link::{LinkConnector, LinkHealth, TransportLink};

/// Outbound frames buffered per link
const OUTBOUND_DEPTH: usize = 64;

struct Inner {
    senders: Mutex<HashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connector: Mutex<Option<Arc<dyn LinkConnector>>>,
}

/// Handle to the link layer, cheap to clone across tasks
#[derive(Clone)]
pub struct TransportManager {
    local_id: PeerId,
    config: TransportConfig,
    event_tx: EventSender,
    inner: Arc<Inner>,
}

impl TransportManager {
    pub fn new(local_id: PeerId, config: TransportConfig, event_tx: EventSender) -> Self {
        Self {
            local_id,
            config,
            event_tx,
            inner: Arc::new(Inner {
                senders: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                connector: Mutex::new(None),
            }),
        }
    }

    /// Install the dialer used to re-establish dropped links
    pub fn set_connector(&self, connector: Arc<dyn LinkConnector>) {
        *self.inner.connector.lock().expect("connector lock") = Some(connector);
    }

    /// Take ownership of an open link and supervise it
    pub fn attach(&self, link: Box<dyn TransportLink>) {
        let peer = link.peer_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        self.inner
            .senders
            .lock()
            .expect("senders lock")
            .insert(peer, outbound_tx);

        let task = tokio::spawn(supervise_link(
            self.local_id,
            self.config.clone(),
            link,
            outbound_rx,
            self.event_tx.clone(),
            Arc::clone(&self.inner),
        ));
        self.inner.tasks.lock().expect("tasks lock").push(task);
    }

    /// Queue a frame for a directly linked peer
    pub async fn send_frame(&self, to: PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .inner
            .senders
            .lock()
            .expect("senders lock")
            .get(&to)
            .cloned()
            .ok_or(TransportError::PeerUnreachable {
                peer_id: to.to_string(),
            })?;
        sender
            .send(bytes)
            .await
            .map_err(|_| TransportError::SendFailed {
                reason: format!("link task for {to} is gone"),
            })
    }

    /// True when a supervised link to the peer exists
    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.inner
            .senders
            .lock()
            .expect("senders lock")
            .contains_key(peer)
    }

    /// Abort every supervisor task and drop all links
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        self.inner.senders.lock().expect("senders lock").clear();
    }
}

// ----------------------------------------------------------------------------
// Link Supervision
// ----------------------------------------------------------------------------

async fn supervise_link(
    local_id: PeerId,
    config: TransportConfig,
    mut link: Box<dyn TransportLink>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: EventSender,
    inner: Arc<Inner>,
) {
    let peer = link.peer_id();
    let mut attempts = 0u32;

    loop {
        run_link(local_id, &config, link.as_mut(), &mut outbound_rx, &event_tx).await;
        emit_update(
            &event_tx,
            peer,
            link.kind(),
            ConnectionState::Disconnected,
            0.0,
            0.0,
        )
        .await;

        // Re-dial with exponential backoff, if we know how
        let connector = inner.connector.lock().expect("connector lock").clone();
        let Some(connector) = connector else { break };

        let mut reconnected = false;
        while attempts < config.max_reconnect_attempts {
            let delay = reconnect_delay(&config, attempts);
            attempts += 1;
            tokio::time::sleep(delay).await;

            match connector.connect(peer).await {
                Ok(fresh) => {
                    tracing::info!(%peer, attempts, "link re-established");
                    link = fresh;
                    attempts = 0;
                    reconnected = true;
                    break;
                }
                Err(err) => {
                    tracing::debug!(%peer, attempts, %err, "reconnect attempt failed");
                }
            }
        }
        if !reconnected {
            tracing::warn!(%peer, "reconnect budget exhausted, link is terminal");
            break;
        }
    }

    inner.senders.lock().expect("senders lock").remove(&peer);
}

fn reconnect_delay(config: &TransportConfig, attempt: u32) -> core::time::Duration {
    let factor = (config.backoff_multiplier as f64).powi(attempt as i32);
    let delay = config.reconnect_base_delay.as_secs_f64() * factor;
    core::time::Duration::from_secs_f64(delay.min(config.reconnect_max_delay.as_secs_f64()))
}

/// Pump one link until it closes: outbound frames, inbound frames, and the
/// heartbeat probe cycle.
async fn run_link(
    local_id: PeerId,
    config: &TransportConfig,
    link: &mut dyn TransportLink,
    outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
    event_tx: &EventSender,
) {
    let peer = link.peer_id();
    let kind = link.kind();
    let mut health = LinkHealth::new();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    emit_update(event_tx, peer, kind, health.state(), health.quality(), 0.0).await;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(bytes) = outbound else { return };
                if let Err(err) = link.send(&bytes).await {
                    tracing::debug!(%peer, %err, "send failed, closing link");
                    return;
                }
            }

            inbound = link.recv() => {
                let Some(bytes) = inbound else {
                    tracing::debug!(%peer, "link closed by peer");
                    return;
                };
                if handle_inbound(local_id, peer, kind, bytes, link, &mut health, event_tx)
                    .await
                    .is_err()
                {
                    return;
                }
            }

            _ = heartbeat.tick() => {
                if health.check_stale(config.stale_threshold) {
                    emit_update(event_tx, peer, kind, health.state(), health.quality(),
                        health.rtt_ms()).await;
                }
                let probe = heartbeat_frame(local_id, MessageType::Heartbeat, now_millis_body());
                if link.send(&probe).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Process one inbound frame. Heartbeats are consumed here; everything else
/// is forwarded to the logic task. Errors mean the link should close.
async fn handle_inbound(
    local_id: PeerId,
    peer: PeerId,
    kind: TransportKind,
    bytes: Vec<u8>,
    link: &mut dyn TransportLink,
    health: &mut LinkHealth,
    event_tx: &EventSender,
) -> Result<(), ()> {
    match Message::decode(&bytes) {
        Ok(msg) if msg.header.msg_type == MessageType::Heartbeat => {
            if health.on_frame() {
                emit_update(event_tx, peer, kind, health.state(), health.quality(),
                    health.rtt_ms()).await;
            }
            let ack = heartbeat_frame(local_id, MessageType::HeartbeatAck, msg.body);
            link.send(&ack).await.map_err(|_| ())?;
        }
        Ok(msg) if msg.header.msg_type == MessageType::HeartbeatAck => {
            if let Some(sent) = parse_millis_body(&msg.body) {
                let rtt = Timestamp::now().as_millis().saturating_sub(sent) as f64;
                health.on_heartbeat_ack(rtt);
                emit_update(event_tx, peer, kind, health.state(), health.quality(),
                    health.rtt_ms()).await;
            }
        }
        _ => {
            // Frame for the logic task, including ones we cannot decode
            // (the relay owns that policy)
            if health.on_frame() {
                emit_update(event_tx, peer, kind, health.state(), health.quality(),
                    health.rtt_ms()).await;
            }
            event_tx
                .send(Event::FrameReceived { from: peer, bytes })
                .await
                .map_err(|_| ())?;
        }
    }
    Ok(())
}

fn heartbeat_frame(local_id: PeerId, msg_type: MessageType, body: Vec<u8>) -> Vec<u8> {
    Message::new(msg_type, local_id, body).encode()
}

fn now_millis_body() -> Vec<u8> {
    Timestamp::now().as_millis().to_be_bytes().to_vec()
}

fn parse_millis_body(body: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = body.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

async fn emit_update(
    event_tx: &EventSender,
    peer_id: PeerId,
    transport: TransportKind,
    state: ConnectionState,
    quality: f64,
    rtt_ms: f64,
) {
    let _ = event_tx
        .send(Event::LinkUpdate {
            peer_id,
            transport,
            state,
            quality,
            rtt_ms,
        })
        .await;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
