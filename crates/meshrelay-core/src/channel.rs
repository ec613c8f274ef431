//! Typed channels between the engine tasks
//!
//! The engine follows a CSP shape: transports and timers feed [`Event`]s into
//! a single logic task, which owns all mutable protocol state and emits
//! [`Effect`]s back out. No locks guard protocol state; channel ownership is
//! the synchronization.

use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::message::Message;
use crate::routing::ConnectionState;
use crate::types::{MessageId, PeerId, Timestamp, TransportKind};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Application-facing requests into the engine
#[derive(Debug, Clone)]
pub enum Command {
    /// Queue a message for delivery (None destination broadcasts)
    SendMessage {
        destination: Option<PeerId>,
        body: Vec<u8>,
        priority: crate::types::Priority,
    },
    /// Begin a courier sync with a directly connected peer
    StartSync { peer_id: PeerId },
    /// Drain in-flight work, persist, and stop
    Shutdown,
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Inputs to the logic task, from transports, timers, and the application
#[derive(Debug, Clone)]
pub enum Event {
    /// Application command
    Command(Command),
    /// Raw frame arrived on a link
    FrameReceived { from: PeerId, bytes: Vec<u8> },
    /// Link state or health changed
    LinkUpdate {
        peer_id: PeerId,
        transport: TransportKind,
        state: ConnectionState,
        quality: f64,
        rtt_ms: f64,
    },
    /// Periodic pass over stored undelivered messages
    RetryTick,
    /// Periodic dedup log prune
    DedupPruneTick,
    /// Periodic stale-peer sweep
    PeerSweepTick,
}

// ----------------------------------------------------------------------------
// Effects
// ----------------------------------------------------------------------------

/// Outputs of the logic task
#[derive(Debug, Clone)]
pub enum Effect {
    /// Hand a frame to the transport layer for one peer
    SendFrame { to: PeerId, bytes: Vec<u8> },
    /// Surface something to the application
    Notify(Notification),
}

/// Application-facing notifications
#[derive(Debug, Clone)]
pub enum Notification {
    /// A message addressed to this node (or a broadcast) arrived
    MessageReceived { message: Message },
    /// The destination acknowledged one of our messages
    MessageDelivered {
        message_id: MessageId,
        acked_at: Timestamp,
    },
    /// A peer link became usable
    PeerConnected { peer_id: PeerId },
    /// A peer link went away
    PeerDisconnected { peer_id: PeerId },
    /// A courier sync finished
    SyncCompleted {
        peer_id: PeerId,
        sent: usize,
        received: usize,
    },
}

// ----------------------------------------------------------------------------
// Channel Construction
// ----------------------------------------------------------------------------

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;
pub type EffectSender = mpsc::Sender<Effect>;
pub type EffectReceiver = mpsc::Receiver<Effect>;

/// All channel endpoints for one engine instance
pub struct Channels {
    pub event_tx: EventSender,
    pub event_rx: EventReceiver,
    pub effect_tx: EffectSender,
    pub effect_rx: EffectReceiver,
}

/// Create the bounded event and effect channels
pub fn create_channels(config: &ChannelConfig) -> Channels {
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
    let (effect_tx, effect_rx) = mpsc::channel(config.effect_buffer_size);
    Channels {
        event_tx,
        event_rx,
        effect_tx,
        effect_rx,
    }
}
