//! # meshrelay-core
//!
//! Platform-independent core of the meshrelay engine: a sovereignty-first
//! mesh communication layer for communities that cannot rely on central
//! infrastructure. Messages hop peer to peer over whatever links exist,
//! wait at rest when no route does, and reconcile through courier syncs
//! when carriers physically move between partitions.
//!
//! This crate holds the protocol logic only: wire codec, routing table,
//! store-and-forward relay, two-tier deduplication, and the courier sync
//! state machine. All of it is synchronous and effect-returning; the
//! `meshrelay-runtime` crate supplies transports, timers, and the task
//! architecture around it.
//!
//! ## Architecture
//!
//! ```text
//! frames in ──> MessageRelay ──> effects out (frames, notifications)
//!                │  │  │
//!                │  │  └── DeduplicationManager (Bloom + persistent log)
//!                │  └───── RoutingTable (ranked peers, forward sets)
//!                └──────── PersistenceAdapter (at-rest copies)
//! ```
//!
//! A single logic task owns all mutable state; capability traits
//! ([`CryptoProvider`], [`PersistenceAdapter`], [`TimeSource`]) are the only
//! seams to the outside world.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod errors;
pub mod message;
pub mod persistence;
pub mod relay;
pub mod routing;
pub mod sync;
pub mod types;

pub use channel::{
    create_channels, Channels, Command, Effect, EffectReceiver, EffectSender, Event,
    EventReceiver, EventSender, Notification,
};
pub use config::{
    ChannelConfig, DedupConfig, MeshConfig, RelayConfig, RoutingConfig, TransportConfig,
};
pub use crypto::{CryptoProvider, DalekCrypto};
pub use dedup::{BloomFilter, DedupStats, DeduplicationManager};
pub use errors::{DecodeError, MeshError, Result, TransportError};
pub use message::{DeliveryAck, Message, MessageHeader, MessageType, HEADER_LEN};
pub use persistence::{MemoryStore, PersistenceAdapter};
pub use relay::{DropReason, MessageRelay, RelayOutcome, RelayStats};
pub use routing::{ConnectionState, PeerMetadata, PeerRecord, RoutingTable};
pub use sync::{SyncFrame, SyncResult, SyncSession, SyncStep};
pub use types::{
    distance_cmp, ManualTimeSource, MessageId, PeerId, Priority, SystemTimeSource, TimeSource,
    Timestamp, TransportKind, Ttl,
};
