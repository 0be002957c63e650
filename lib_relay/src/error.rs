//! # Relay Error Types
//!
//! Two layers of errors flow through the relay:
//!
//! - [`PeerError`] describes a failure on one streaming connection (a read, a
//!   write, a write that missed its deadline). It is contained to the peer that
//!   produced it and surfaces on that peer's error queue.
//! - [`RelayError`] is what the public operations of the core return: a
//!   duplicate registration, a transport failure lifted from a `PeerError`, or
//!   a malformed configuration detected at startup.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError;

use crate::connections::peer::PeerId;

/// Boxed error used by transports that are not tungstenite streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
/// # Peer Error
///
/// A failure on a single peer connection.
pub enum PeerError {
    /// The WebSocket protocol layer reported an error (I/O, protocol violation,
    /// capacity, ...).
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The peer did not accept a frame within the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The handle was already closed when a write was attempted.
    #[error("peer connection is closed")]
    Closed,
}

impl PeerError {
    /// Lifts a boxed transport error, recovering the tungstenite error when the
    /// transport is a thin wrapper around one (axum does this).
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<tungstenite::Error>() {
            Ok(ws) => PeerError::WebSocket(*ws),
            Err(other) => PeerError::Transport(other),
        }
    }

    /// Whether this error only says "the connection ended normally".
    ///
    /// Such errors are swallowed by the read loop and never reach the error
    /// queue.
    pub fn is_normal_close(&self) -> bool {
        matches!(
            self,
            PeerError::Closed
                | PeerError::WebSocket(tungstenite::Error::ConnectionClosed)
                | PeerError::WebSocket(tungstenite::Error::AlreadyClosed)
                | PeerError::WebSocket(tungstenite::Error::Protocol(
                    ProtocolError::SendAfterClosing
                ))
        )
    }
}

#[derive(Debug, Error)]
/// # Relay Error
///
/// Errors returned by the registry, hub and supervisor operations.
pub enum RelayError {
    /// A peer with this identity is already registered. The existing entry is
    /// kept; the caller decides what to do with the rejected handle.
    #[error("conflict - peer {0} is already registered")]
    Conflict(PeerId),

    /// The upstream or a downstream transport failed.
    #[error("connection error: {0}")]
    Connection(#[from] PeerError),

    /// The environment handed to the relay is malformed. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Shorthand for a [`RelayError::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        RelayError::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_normal_close_classification() {
        assert!(PeerError::Closed.is_normal_close());
        assert!(PeerError::WebSocket(tungstenite::Error::ConnectionClosed).is_normal_close());
        assert!(PeerError::WebSocket(tungstenite::Error::AlreadyClosed).is_normal_close());
        let late = tungstenite::Error::Protocol(ProtocolError::SendAfterClosing);
        assert!(PeerError::WebSocket(late).is_normal_close());

        let io_err = tungstenite::Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!PeerError::WebSocket(io_err).is_normal_close());
        assert!(!PeerError::WriteTimeout(Duration::from_secs(5)).is_normal_close());
    }

    #[test]
    fn test_from_boxed_recovers_tungstenite_error() {
        let boxed: BoxError = Box::new(tungstenite::Error::ConnectionClosed);
        assert!(matches!(
            PeerError::from_boxed(boxed),
            PeerError::WebSocket(tungstenite::Error::ConnectionClosed)
        ));

        let boxed: BoxError = Box::new(io::Error::other("boom"));
        assert!(matches!(PeerError::from_boxed(boxed), PeerError::Transport(_)));
    }

    #[test]
    fn test_conflict_message_names_the_peer() {
        let err = RelayError::Conflict(PeerId::from(42u64));
        assert_eq!(err.to_string(), "conflict - peer 42 is already registered");
    }
}
