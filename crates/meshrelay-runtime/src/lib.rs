//! # meshrelay-runtime
//!
//! Tokio orchestration for the meshrelay engine: transport links and their
//! supervision, maintenance timers, courier session management, and the
//! runtime that ties them to the protocol core.
//!
//! The split mirrors the engine's concurrency model. `meshrelay-core` is
//! synchronous and effect-returning; this crate owns the single logic task
//! that drives it, the per-link supervisor tasks, and the channels between
//! them.

pub mod courier;
pub mod link;
pub mod runtime;
pub mod scheduler;
pub mod transport;

pub use courier::{CourierManager, CourierStep};
pub use link::{LinkConnector, LinkHealth, MemoryLink, TransportLink};
pub use runtime::{MeshHandle, MeshRuntime, NodeIdentity};
pub use scheduler::Scheduler;
pub use transport::TransportManager;
