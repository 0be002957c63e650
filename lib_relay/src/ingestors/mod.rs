//! # Data Ingestors Module
//!
//! Clients for the upstream data sources. Each ingestor turns a remote feed
//! into a [`PeerHandle`](crate::connections::peer::PeerHandle) that the core
//! can supervise.
//!
//! ## Contained Modules:
//! - **`feed_wss`**: the WebSocket connector for the mark-price stream.

/// The WebSocket connector for the upstream price feed.
pub mod feed_wss;

pub use feed_wss::{WssConfig, WssConnector, DEFAULT_FEED_URL};
