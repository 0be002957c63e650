//! # Core Engine Module
//!
//! The relay's fan-out core. It tracks peers, broadcasts upstream payloads to
//! every subscriber and supervises the single upstream session.
//!
//! ## Core Components:
//!
//! - **`registry`**: a concurrency-safe map of live peers keyed by identity,
//!   with snapshotting for lock-free iteration.
//!
//! - **`hub`**: the broadcaster. It hands one payload to every subscriber
//!   concurrently and keeps going when individual writes fail. It also runs
//!   the per-subscriber session.
//!
//! - **`supervisor`**: the upstream state machine
//!   (`Disconnected -> Connecting -> Streaming -> Closing`). It forwards every
//!   upstream payload to the hub and answers upstream heartbeats.

/// Keyed, lock-protected collection of peers.
pub mod registry;
/// Concurrent fan-out to downstream peers.
pub mod hub;
/// The single upstream session state machine.
pub mod supervisor;

// --- Public API Re-exports ---
pub use hub::{BroadcastHub, PublishReport};
pub use registry::Registry;
pub use supervisor::{
    FeedConfig, FeedExit, FeedState, FeedSupervisor, UpstreamConnector, UPSTREAM_PEER,
};
