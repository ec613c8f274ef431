//! Transport link abstraction
//!
//! A [`TransportLink`] is one open, framed, bidirectional channel to a single
//! peer. The transport manager owns each link inside a supervisor task and
//! probes it with heartbeats; [`LinkHealth`] turns observed round trips and
//! silence into the quality score and connection state the routing table
//! consumes.
//!
//! [`MemoryLink`] is the in-process implementation used by tests and
//! simulations. Network transports implement the same trait.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use meshrelay_core::errors::TransportError;
use meshrelay_core::routing::ConnectionState;
use meshrelay_core::types::{PeerId, TransportKind};

/// Frames buffered per direction on an in-memory link
const MEMORY_LINK_DEPTH: usize = 64;

/// EWMA weight for new RTT samples
const RTT_ALPHA: f64 = 0.3;

/// Quality assumed before the first RTT sample arrives
const INITIAL_QUALITY: f64 = 50.0;

// ----------------------------------------------------------------------------
// TransportLink Trait
// ----------------------------------------------------------------------------

/// One open channel to one peer. Implementations frame their own wire
/// format; the engine hands over complete frames.
#[async_trait]
pub trait TransportLink: Send {
    /// Peer on the far end
    fn peer_id(&self) -> PeerId;

    /// Medium this link runs over
    fn kind(&self) -> TransportKind;

    /// Send one frame. An error means the link is unusable.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame, or None once the link has closed
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Dials replacement links when one drops. Transports that cannot re-dial
/// (an accepted inbound connection, a sneakernet drive) simply do not
/// provide one.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self, peer_id: PeerId) -> Result<Box<dyn TransportLink>, TransportError>;
}

// ----------------------------------------------------------------------------
// Link Health
// ----------------------------------------------------------------------------

/// Rolling health estimate for one link.
///
/// A fresh link starts in `Connecting` and is promoted to `Connected` by the
/// first frame or heartbeat ack. Quality maps RTT onto 0-100:
/// `clamp(100 - rtt_ms / 10, 0, 100)`, so a 200ms link scores 80 and anything
/// past a second scores 0. Silence beyond the stale threshold degrades the
/// link without closing it.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    rtt_ms: Option<f64>,
    last_heard: Instant,
    state: ConnectionState,
}

impl LinkHealth {
    pub fn new() -> Self {
        Self {
            rtt_ms: None,
            last_heard: Instant::now(),
            state: ConnectionState::Connecting,
        }
    }

    /// Fold in one RTT sample from a heartbeat round trip
    pub fn on_heartbeat_ack(&mut self, rtt_ms: f64) {
        self.rtt_ms = Some(match self.rtt_ms {
            Some(prev) => prev * (1.0 - RTT_ALPHA) + rtt_ms * RTT_ALPHA,
            None => rtt_ms,
        });
        self.last_heard = Instant::now();
        self.state = ConnectionState::Connected;
    }

    /// Any inbound frame proves the link is alive. Returns true when the
    /// state changed.
    pub fn on_frame(&mut self) -> bool {
        self.last_heard = Instant::now();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Degraded
        ) {
            self.state = ConnectionState::Connected;
            return true;
        }
        false
    }

    /// Degrade the link if it has been silent too long. Returns true when
    /// the state changed.
    pub fn check_stale(&mut self, stale_threshold: core::time::Duration) -> bool {
        if self.state == ConnectionState::Connected
            && self.last_heard.elapsed() > stale_threshold
        {
            self.state = ConnectionState::Degraded;
            return true;
        }
        false
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Smoothed RTT estimate in milliseconds
    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms.unwrap_or(0.0)
    }

    /// Quality score for the routing table, 0-100
    pub fn quality(&self) -> f64 {
        match self.rtt_ms {
            Some(rtt) => (100.0 - rtt / 10.0).clamp(0.0, 100.0),
            None => INITIAL_QUALITY,
        }
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// In-Memory Link
// ----------------------------------------------------------------------------

/// In-process link built from a pair of bounded channels
pub struct MemoryLink {
    peer_id: PeerId,
    kind: TransportKind,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryLink {
    /// Create both ends of a link between two peers
    pub fn pair(a: PeerId, b: PeerId, kind: TransportKind) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_LINK_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_LINK_DEPTH);
        (
            MemoryLink {
                peer_id: b,
                kind,
                tx: a_tx,
                rx: a_rx,
            },
            MemoryLink {
                peer_id: a,
                kind,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl TransportLink for MemoryLink {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| TransportError::LinkClosed {
                reason: "memory link peer dropped".to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
