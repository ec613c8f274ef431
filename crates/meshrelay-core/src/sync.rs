//! Courier sync protocol
//!
//! When two nodes meet after a partition (a courier docking with a village
//! mesh, two phones crossing paths), they reconcile stored messages with a
//! bounded exchange instead of replaying everything:
//!
//! 1. `Request` / `Response`: each side shares its Bloom summary of seen IDs
//! 2. `RequestMessages`: explicit ID confirmation, because a Bloom summary
//!    has false positives and would silently skip ~1% of messages
//! 3. `Batch` / `FinalBatch`: full messages, highest priority first
//! 4. `Complete`: both sides agree the session is over
//!
//! [`SyncSession`] is a pure state machine: it consumes frames and returns
//! the reply to send, never touching the network itself. Batch messages are
//! ingested through the relay's normal inbound path, so sync transfers get
//! the same signature, dedup, and storage treatment as live traffic.

use serde::{Deserialize, Serialize};

use crate::channel::Effect;
use crate::dedup::{BloomFilter, DeduplicationManager};
use crate::relay::MessageRelay;
use crate::routing::RoutingTable;
use crate::types::{MessageId, PeerId, TimeSource};
use crate::{MeshError, Result};

// ----------------------------------------------------------------------------
// Wire Frames
// ----------------------------------------------------------------------------

/// Frames exchanged during a courier sync session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncFrame {
    /// Initiator's Bloom summary of seen message IDs
    Request { summary: BloomFilter },
    /// Responder's summary plus the IDs it offers (absent from the
    /// initiator's summary)
    Response {
        summary: BloomFilter,
        offered: Vec<MessageId>,
    },
    /// Initiator confirms which offered IDs it actually lacks and makes its
    /// own offer
    RequestMessages {
        wanted: Vec<MessageId>,
        offered: Vec<MessageId>,
    },
    /// Responder's messages plus its confirmation of the initiator's offer
    Batch {
        messages: Vec<Vec<u8>>,
        wanted: Vec<MessageId>,
    },
    /// Initiator's messages, closing the transfer
    FinalBatch { messages: Vec<Vec<u8>> },
    /// Session finished
    Complete,
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    // Initiator path
    AwaitResponse,
    AwaitBatch,
    AwaitComplete,
    // Responder path
    Idle,
    AwaitRequestMessages,
    AwaitFinalBatch,
    Done,
}

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResult {
    pub peer_id: PeerId,
    /// Full messages sent to the peer
    pub sent: usize,
    /// Full messages accepted from the peer
    pub received: usize,
}

/// What to do after feeding one frame into the session
pub struct SyncStep {
    /// Frame to send back, if any
    pub reply: Option<SyncFrame>,
    /// Effects produced by ingesting batch messages (local deliveries,
    /// onward forwards)
    pub effects: Vec<Effect>,
    /// Present once the session has finished
    pub result: Option<SyncResult>,
}

impl SyncStep {
    fn reply(frame: SyncFrame) -> Self {
        Self {
            reply: Some(frame),
            effects: Vec::new(),
            result: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Sync Session
// ----------------------------------------------------------------------------

/// One in-flight reconciliation with a single peer
pub struct SyncSession {
    peer_id: PeerId,
    state: SessionState,
    sent: usize,
    received: usize,
}

impl SyncSession {
    /// Start a session as the initiator, producing the opening frame
    pub fn initiate<T: TimeSource>(
        peer_id: PeerId,
        dedup: &DeduplicationManager<T>,
    ) -> (Self, SyncFrame) {
        let session = Self {
            peer_id,
            state: SessionState::AwaitResponse,
            sent: 0,
            received: 0,
        };
        let frame = SyncFrame::Request {
            summary: dedup.filter().clone(),
        };
        (session, frame)
    }

    /// Accept a session as the responder. The first frame must be `Request`.
    pub fn respond(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: SessionState::Idle,
            sent: 0,
            received: 0,
        }
    }

    /// Peer this session reconciles with
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Feed one frame from the peer into the state machine
    pub fn on_frame<T: TimeSource>(
        &mut self,
        frame: SyncFrame,
        relay: &mut MessageRelay<T>,
        routing: &mut RoutingTable<T>,
        dedup: &mut DeduplicationManager<T>,
    ) -> Result<SyncStep> {
        match (self.state, frame) {
            // Responder: summary arrived, offer what the peer seems to lack
            (SessionState::Idle, SyncFrame::Request { summary }) => {
                let offered = Self::offer(relay, &summary);
                self.state = SessionState::AwaitRequestMessages;
                Ok(SyncStep::reply(SyncFrame::Response {
                    summary: dedup.filter().clone(),
                    offered,
                }))
            }

            // Initiator: confirm the peer's offer exactly, make our own
            (SessionState::AwaitResponse, SyncFrame::Response { summary, offered }) => {
                let wanted = Self::confirm(dedup, &offered)?;
                let our_offer = Self::offer(relay, &summary);
                self.state = SessionState::AwaitBatch;
                Ok(SyncStep::reply(SyncFrame::RequestMessages {
                    wanted,
                    offered: our_offer,
                }))
            }

            // Responder: ship the confirmed messages, confirm their offer
            (
                SessionState::AwaitRequestMessages,
                SyncFrame::RequestMessages { wanted, offered },
            ) => {
                let messages = Self::resolve(relay, &wanted)?;
                self.sent += messages.len();
                let our_wanted = Self::confirm(dedup, &offered)?;
                self.state = SessionState::AwaitFinalBatch;
                Ok(SyncStep::reply(SyncFrame::Batch {
                    messages,
                    wanted: our_wanted,
                }))
            }

            // Initiator: ingest their batch, ship ours
            (SessionState::AwaitBatch, SyncFrame::Batch { messages, wanted }) => {
                let effects = self.ingest(messages, relay, routing, dedup)?;
                let outgoing = Self::resolve(relay, &wanted)?;
                self.sent += outgoing.len();
                self.state = SessionState::AwaitComplete;
                Ok(SyncStep {
                    reply: Some(SyncFrame::FinalBatch { messages: outgoing }),
                    effects,
                    result: None,
                })
            }

            // Responder: ingest the final batch and close
            (SessionState::AwaitFinalBatch, SyncFrame::FinalBatch { messages }) => {
                let effects = self.ingest(messages, relay, routing, dedup)?;
                self.state = SessionState::Done;
                Ok(SyncStep {
                    reply: Some(SyncFrame::Complete),
                    effects,
                    result: Some(self.result()),
                })
            }

            // Initiator: done
            (SessionState::AwaitComplete, SyncFrame::Complete) => {
                self.state = SessionState::Done;
                Ok(SyncStep {
                    reply: None,
                    effects: Vec::new(),
                    result: Some(self.result()),
                })
            }

            (state, frame) => {
                tracing::warn!(?state, peer = %self.peer_id, "unexpected sync frame");
                let _ = frame;
                Err(MeshError::decode("sync frame out of sequence"))
            }
        }
    }

    fn result(&self) -> SyncResult {
        SyncResult {
            peer_id: self.peer_id,
            sent: self.sent,
            received: self.received,
        }
    }

    /// Stored IDs the peer's summary does not contain, priority ordered so
    /// Emergency traffic crosses first if the session is cut short
    fn offer<T: TimeSource>(relay: &MessageRelay<T>, peer_summary: &BloomFilter) -> Vec<MessageId> {
        relay
            .stored_ids_by_priority()
            .into_iter()
            .filter(|id| !peer_summary.contains(id))
            .collect()
    }

    /// Exact confirmation against the local log, dropping Bloom noise
    fn confirm<T: TimeSource>(
        dedup: &DeduplicationManager<T>,
        offered: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        let mut wanted = Vec::with_capacity(offered.len());
        for id in offered {
            if !dedup.seen(id)? {
                wanted.push(*id);
            }
        }
        Ok(wanted)
    }

    /// Load requested messages, skipping any evicted since the offer
    fn resolve<T: TimeSource>(
        relay: &MessageRelay<T>,
        wanted: &[MessageId],
    ) -> Result<Vec<Vec<u8>>> {
        let mut messages = Vec::with_capacity(wanted.len());
        for id in wanted {
            if let Some(message) = relay.load_message(id)? {
                messages.push(message.encode());
            }
        }
        Ok(messages)
    }

    /// Run batch messages through the relay's normal inbound path
    fn ingest<T: TimeSource>(
        &mut self,
        messages: Vec<Vec<u8>>,
        relay: &mut MessageRelay<T>,
        routing: &mut RoutingTable<T>,
        dedup: &mut DeduplicationManager<T>,
    ) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        for bytes in messages {
            let (outcome, mut step_effects) =
                relay.handle_incoming(routing, dedup, self.peer_id, &bytes)?;
            if !matches!(
                outcome,
                crate::relay::RelayOutcome::Duplicate
                    | crate::relay::RelayOutcome::Dropped(_)
            ) {
                self.received += 1;
            }
            effects.append(&mut step_effects);
        }
        Ok(effects)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
