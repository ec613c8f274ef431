//! Error types for the meshrelay engine
//!
//! Nothing in this crate is fatal to the process: every failure mode degrades
//! to "not delivered yet, will retry" or "dropped per policy". Duplicate
//! detection is deliberately *not* an error: it is a normal gating outcome
//! surfaced as [`crate::relay::RelayOutcome::Duplicate`].

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport-level failures: send/connect problems, retried with backoff by
/// the transport layer and surfaced to the relay as "no route" when exhausted.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed to peer {peer_id}: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },
    #[error("no transport can reach peer {peer_id}")]
    PeerUnreachable { peer_id: String },
    #[error("send failed: {reason}")]
    SendFailed { reason: String },
    #[error("link closed: {reason}")]
    LinkClosed { reason: String },
    #[error("transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed wire data: dropped silently, never forwarded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short (expected at least {expected}, got {actual})")]
    Truncated { expected: usize, actual: usize },
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u8 },
    #[error("unknown message type: {message_type}")]
    UnknownMessageType { message_type: u8 },
    #[error("unknown priority class: {priority}")]
    UnknownPriority { priority: u8 },
    #[error("signature verification failed")]
    BadSignature,
    #[error("{message}")]
    Generic { message: String },
}

impl From<String> for DecodeError {
    fn from(message: String) -> Self {
        DecodeError::Generic { message }
    }
}

impl From<&str> for DecodeError {
    fn from(message: &str) -> Self {
        DecodeError::Generic {
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the meshrelay engine
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("cryptographic error: {reason}")]
    Crypto { reason: String },

    #[error("expired: {reason}")]
    Expired { reason: String },

    #[error("storage quota exceeded: need {needed} bytes, budget {budget}")]
    Quota { needed: usize, budget: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Channel communication error (internal to the task architecture)
    #[error("channel error: {message}")]
    Channel { message: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MeshError {
    /// Create a decode error with a message
    pub fn decode<T: Into<String>>(message: T) -> Self {
        MeshError::Decode(DecodeError::Generic {
            message: message.into(),
        })
    }

    /// Create a crypto error with a reason
    pub fn crypto<T: Into<String>>(reason: T) -> Self {
        MeshError::Crypto {
            reason: reason.into(),
        }
    }

    /// Create an expired error with a reason
    pub fn expired<T: Into<String>>(reason: T) -> Self {
        MeshError::Expired {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel<T: Into<String>>(message: T) -> Self {
        MeshError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config<T: Into<String>>(reason: T) -> Self {
        MeshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a peer-unreachable transport error
    pub fn unreachable(peer_id: impl ToString) -> Self {
        MeshError::Transport(TransportError::PeerUnreachable {
            peer_id: peer_id.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshError>;
