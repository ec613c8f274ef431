//! Courier session management
//!
//! Bridges the pure [`SyncSession`] state machine onto the wire: sync frames
//! travel inside signed messages (types `SyncRequest` through
//! `SyncComplete`), one session per peer at a time. A frame that arrives out
//! of sequence kills its session rather than the node; the next encounter
//! simply starts over.

use hashbrown::HashMap;

use meshrelay_core::channel::Effect;
use meshrelay_core::crypto::CryptoProvider;
use meshrelay_core::dedup::DeduplicationManager;
use meshrelay_core::message::{Message, MessageType};
use meshrelay_core::relay::MessageRelay;
use meshrelay_core::routing::RoutingTable;
use meshrelay_core::sync::{SyncFrame, SyncResult, SyncSession};
use meshrelay_core::types::{PeerId, TimeSource};
use meshrelay_core::Result;

use crate::runtime::NodeIdentity;

/// What to do after feeding one sync message in
pub struct CourierStep {
    /// Signed reply to send back over the same link
    pub reply: Option<Message>,
    /// Effects from ingested batch messages
    pub effects: Vec<Effect>,
    /// Present once the session with this peer finished
    pub completed: Option<SyncResult>,
}

impl CourierStep {
    fn empty() -> Self {
        Self {
            reply: None,
            effects: Vec::new(),
            completed: None,
        }
    }
}

/// Active courier sessions for one node
#[derive(Default)]
pub struct CourierManager {
    sessions: HashMap<PeerId, SyncSession>,
}

impl CourierManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session with a peer, producing the signed opening message.
    /// Returns None when a session with that peer is already running.
    pub fn start_session<T: TimeSource>(
        &mut self,
        peer: PeerId,
        dedup: &DeduplicationManager<T>,
        identity: &NodeIdentity,
        crypto: &dyn CryptoProvider,
    ) -> Result<Option<Message>> {
        if self.sessions.contains_key(&peer) {
            tracing::debug!(%peer, "sync already in progress");
            return Ok(None);
        }
        let (session, frame) = SyncSession::initiate(peer, dedup);
        self.sessions.insert(peer, session);
        Ok(Some(wrap(&frame, peer, identity, crypto)?))
    }

    /// Feed one signed sync message from a peer into its session
    pub fn handle_frame<T: TimeSource>(
        &mut self,
        from: PeerId,
        message: &Message,
        relay: &mut MessageRelay<T>,
        routing: &mut RoutingTable<T>,
        dedup: &mut DeduplicationManager<T>,
        identity: &NodeIdentity,
        crypto: &dyn CryptoProvider,
    ) -> Result<CourierStep> {
        if !message.verify(crypto) {
            tracing::warn!(%from, "sync message with bad signature, ignoring");
            return Ok(CourierStep::empty());
        }
        let frame: SyncFrame = match bincode::deserialize(&message.body) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%from, %err, "malformed sync frame, ignoring");
                return Ok(CourierStep::empty());
            }
        };

        let session = self
            .sessions
            .entry(from)
            .or_insert_with(|| SyncSession::respond(from));

        match session.on_frame(frame, relay, routing, dedup) {
            Ok(step) => {
                if step.result.is_some() {
                    self.sessions.remove(&from);
                }
                let reply = step
                    .reply
                    .map(|frame| wrap(&frame, from, identity, crypto))
                    .transpose()?;
                Ok(CourierStep {
                    reply,
                    effects: step.effects,
                    completed: step.result,
                })
            }
            Err(err) => {
                // Broken session: drop it and let a future encounter retry
                tracing::warn!(%from, %err, "sync session aborted");
                self.sessions.remove(&from);
                Ok(CourierStep::empty())
            }
        }
    }

    /// Number of sessions currently in flight
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Wrap a sync frame in a signed wire message for one peer
fn wrap(
    frame: &SyncFrame,
    to: PeerId,
    identity: &NodeIdentity,
    crypto: &dyn CryptoProvider,
) -> Result<Message> {
    let msg_type = match frame {
        SyncFrame::Request { .. } => MessageType::SyncRequest,
        SyncFrame::Response { .. } => MessageType::SyncResponse,
        SyncFrame::RequestMessages { .. } => MessageType::RequestMessages,
        SyncFrame::Batch { .. } | SyncFrame::FinalBatch { .. } => MessageType::MessageBatch,
        SyncFrame::Complete => MessageType::SyncComplete,
    };
    let mut message =
        Message::new(msg_type, identity.peer_id, bincode::serialize(frame)?).with_destination(to);
    message.sign(crypto, identity.private_key())?;
    Ok(message)
}

/// True when a message type belongs to the courier layer
pub fn is_sync_type(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::SyncRequest
            | MessageType::SyncResponse
            | MessageType::RequestMessages
            | MessageType::MessageBatch
            | MessageType::SyncComplete
    )
}
