//! # Connections Module
//!
//! Streaming peer connections: the frame model shared by every transport and
//! the [`PeerHandle`](peer::PeerHandle) lifecycle wrapped around each
//! connection.

/// Frame type and WebSocket adapters.
pub mod frame;

/// Peer identity, configuration and the handle lifecycle.
pub mod peer;

pub use frame::{Frame, FrameSink, FrameStream, WireMessage};
pub use peer::{PeerConfig, PeerEvents, PeerHandle, PeerId};
