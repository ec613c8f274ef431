//! Wire message structures and binary codec
//!
//! Defines the fixed 109-byte message header and the payload envelope used by
//! the relay. The binary layout is hand-rolled for cross-platform
//! compatibility:
//!
//! ```text
//! version:u8 | type:u8 | ttl:u8 | hopCount:u8 | priority:u8 |
//! timestamp:u64 | senderId:[u8;32] | signature:[u8;64] | payload...
//! ```
//!
//! The payload region starts with a destination envelope
//! (`0x01 | dest:[u8;32]` or `0x00` for broadcast) followed by the opaque,
//! possibly encrypted body. Relays that cannot parse the envelope treat the
//! message as broadcast/discovery.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::CryptoProvider;
use crate::errors::DecodeError;
use crate::types::{MessageId, PeerId, Priority, Timestamp, Ttl};
use crate::{MeshError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Fixed header size on the wire
pub const HEADER_LEN: usize = 109;

/// Size of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Size of a PeerId
pub const PEER_ID_LEN: usize = 32;

/// Destination envelope flags
const DEST_NONE: u8 = 0x00;
const DEST_PEER: u8 = 0x01;

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Message types carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Application data for a destination peer (or broadcast)
    Data = 0x01,
    /// Delivery acknowledgment from the final destination
    DeliveryAck = 0x02,
    /// Identity/presence announcement
    Announce = 0x10,
    /// Link health probe
    Heartbeat = 0x20,
    /// Link health probe response
    HeartbeatAck = 0x21,
    /// Courier sync: Bloom summary offer
    SyncRequest = 0x30,
    /// Courier sync: Bloom summary reply
    SyncResponse = 0x31,
    /// Courier sync: explicit missing-ID confirmation round
    RequestMessages = 0x32,
    /// Courier sync: batch of full messages
    MessageBatch = 0x33,
    /// Courier sync: completion marker
    SyncComplete = 0x34,
}

impl MessageType {
    /// Convert from u8, returning None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::DeliveryAck),
            0x10 => Some(Self::Announce),
            0x20 => Some(Self::Heartbeat),
            0x21 => Some(Self::HeartbeatAck),
            0x30 => Some(Self::SyncRequest),
            0x31 => Some(Self::SyncResponse),
            0x32 => Some(Self::RequestMessages),
            0x33 => Some(Self::MessageBatch),
            0x34 => Some(Self::SyncComplete),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Message Header
// ----------------------------------------------------------------------------

/// Fixed-size wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Message type
    pub msg_type: MessageType,
    /// Remaining relay budget, decremented per hop
    pub ttl: Ttl,
    /// Hops taken so far, incremented per hop
    pub hop_count: u8,
    /// Priority class (drives retention and courier ordering)
    pub priority: Priority,
    /// Creation timestamp
    pub timestamp: Timestamp,
    /// Sender's peer ID
    pub sender_id: PeerId,
    /// Ed25519 signature over the signable bytes
    pub signature: [u8; SIGNATURE_LEN],
}

impl MessageHeader {
    /// Current protocol version
    pub const CURRENT_VERSION: u8 = 1;
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A complete wire message: header, destination envelope, and opaque body.
///
/// Immutable once signed, except for the per-hop `ttl`/`hop_count` header
/// fields, which are excluded from both the signature and the message ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    /// Destination peer, None for broadcast/discovery
    pub destination: Option<PeerId>,
    /// Opaque (typically encrypted) body
    pub body: Vec<u8>,
}

impl Message {
    /// Create a new unsigned message
    pub fn new(msg_type: MessageType, sender_id: PeerId, body: Vec<u8>) -> Self {
        Self {
            header: MessageHeader {
                version: MessageHeader::CURRENT_VERSION,
                msg_type,
                ttl: Ttl::default(),
                hop_count: 0,
                priority: Priority::default(),
                timestamp: Timestamp::now(),
                sender_id,
                signature: [0u8; SIGNATURE_LEN],
            },
            destination: None,
            body,
        }
    }

    /// Set the destination peer
    pub fn with_destination(mut self, destination: PeerId) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.header.ttl = ttl;
        self
    }

    /// Override the creation timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Check if this is a broadcast/discovery message
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    /// Bytes covered by the signature: the header with the signature zeroed
    /// *and* ttl/hop_count zeroed (they mutate per hop), concatenated with
    /// the payload region.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload_region_len());
        bytes.push(self.header.version);
        bytes.push(self.header.msg_type as u8);
        bytes.push(0); // ttl, excluded from signature
        bytes.push(0); // hop_count, excluded from signature
        bytes.push(self.header.priority as u8);
        bytes.extend_from_slice(&self.header.timestamp.as_millis().to_be_bytes());
        bytes.extend_from_slice(self.header.sender_id.as_bytes());
        bytes.extend_from_slice(&[0u8; SIGNATURE_LEN]);
        self.write_payload_region(&mut bytes);
        bytes
    }

    /// Content-derived message identifier, stable across hops
    pub fn id(&self) -> MessageId {
        let digest = Sha256::digest(self.signable_bytes());
        MessageId::from_bytes(digest.into())
    }

    /// Sign the message in place with the given provider and private key
    pub fn sign(&mut self, crypto: &dyn CryptoProvider, private_key: &[u8]) -> Result<()> {
        let sig = crypto.sign(&self.signable_bytes(), private_key)?;
        self.header.signature = sig;
        Ok(())
    }

    /// Verify the signature under the sender's declared public key
    /// (the sender ID *is* the public key).
    pub fn verify(&self, crypto: &dyn CryptoProvider) -> bool {
        crypto.verify(
            &self.signable_bytes(),
            &self.header.signature,
            self.header.sender_id.as_bytes(),
        )
    }

    // ------------------------------------------------------------------------
    // Binary codec
    // ------------------------------------------------------------------------

    /// Encode to binary wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload_region_len());
        bytes.push(self.header.version);
        bytes.push(self.header.msg_type as u8);
        bytes.push(self.header.ttl.value());
        bytes.push(self.header.hop_count);
        bytes.push(self.header.priority as u8);
        bytes.extend_from_slice(&self.header.timestamp.as_millis().to_be_bytes());
        bytes.extend_from_slice(self.header.sender_id.as_bytes());
        bytes.extend_from_slice(&self.header.signature);
        debug_assert_eq!(bytes.len(), HEADER_LEN);
        self.write_payload_region(&mut bytes);
        bytes
    }

    /// Decode from binary wire format
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(MeshError::Decode(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            }));
        }

        let version = bytes[0];
        if version != MessageHeader::CURRENT_VERSION {
            return Err(MeshError::Decode(DecodeError::UnsupportedVersion {
                version,
            }));
        }

        let msg_type = MessageType::from_u8(bytes[1]).ok_or(MeshError::Decode(
            DecodeError::UnknownMessageType {
                message_type: bytes[1],
            },
        ))?;
        let ttl = Ttl::new(bytes[2]);
        let hop_count = bytes[3];
        let priority = Priority::from_u8(bytes[4]).ok_or(MeshError::Decode(
            DecodeError::UnknownPriority { priority: bytes[4] },
        ))?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[5..13]);
        let timestamp = Timestamp::new(u64::from_be_bytes(ts));

        let mut sender = [0u8; PEER_ID_LEN];
        sender.copy_from_slice(&bytes[13..45]);
        let sender_id = PeerId::new(sender);

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[45..HEADER_LEN]);

        let payload = &bytes[HEADER_LEN..];
        let (destination, body) = Self::parse_payload_region(payload);

        Ok(Self {
            header: MessageHeader {
                version,
                msg_type,
                ttl,
                hop_count,
                priority,
                timestamp,
                sender_id,
                signature,
            },
            destination,
            body,
        })
    }

    fn payload_region_len(&self) -> usize {
        1 + if self.destination.is_some() {
            PEER_ID_LEN
        } else {
            0
        } + self.body.len()
    }

    fn write_payload_region(&self, bytes: &mut Vec<u8>) {
        match self.destination {
            Some(dest) => {
                bytes.push(DEST_PEER);
                bytes.extend_from_slice(dest.as_bytes());
            }
            None => bytes.push(DEST_NONE),
        }
        bytes.extend_from_slice(&self.body);
    }

    /// Parse the destination envelope. An unparseable envelope is not an
    /// error: the message falls back to broadcast/discovery and the raw
    /// payload is preserved as the body.
    fn parse_payload_region(payload: &[u8]) -> (Option<PeerId>, Vec<u8>) {
        match payload.first() {
            Some(&DEST_NONE) => (None, payload[1..].to_vec()),
            Some(&DEST_PEER) if payload.len() >= 1 + PEER_ID_LEN => {
                let mut dest = [0u8; PEER_ID_LEN];
                dest.copy_from_slice(&payload[1..1 + PEER_ID_LEN]);
                (Some(PeerId::new(dest)), payload[1 + PEER_ID_LEN..].to_vec())
            }
            _ => (None, payload.to_vec()),
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Acknowledgment Payload
// ----------------------------------------------------------------------------

/// Body of a `DeliveryAck` message, confirming receipt of a `Data` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// ID of the acknowledged message
    pub message_id: MessageId,
    /// Timestamp of acknowledgment
    pub timestamp: Timestamp,
}

impl DeliveryAck {
    /// Create a new delivery acknowledgment
    pub fn new(message_id: MessageId, now: Timestamp) -> Self {
        Self {
            message_id,
            timestamp: now,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
