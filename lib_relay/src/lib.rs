//! # lib_relay
//!
//! Relays one upstream real-time price feed to many WebSocket subscribers.
//!
//! ```text
//! upstream WSS -> PeerHandle (read task) -> FeedSupervisor -> BroadcastHub
//!              -> Registry snapshot -> PeerHandle (each subscriber)
//! ```
//!
//! The `servers` crate wires these pieces behind an HTTP gateway.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connections;
pub mod core;
pub mod error;
pub mod ingestors;
pub mod lifecycle;

#[cfg(test)]
mod test_support;

// Re-export everything the binary needs
pub use crate::connections::{Frame, PeerConfig, PeerEvents, PeerHandle, PeerId};
pub use crate::core::{
    BroadcastHub, FeedConfig, FeedExit, FeedState, FeedSupervisor, PublishReport, Registry,
    UpstreamConnector, UPSTREAM_PEER,
};
pub use crate::error::{BoxError, PeerError, RelayError};
pub use crate::ingestors::{WssConfig, WssConnector, DEFAULT_FEED_URL};
pub use crate::lifecycle::{FeedModule, LifecycleConfig, Module, ModuleError, ModuleSet, ReconnectPolicy};
