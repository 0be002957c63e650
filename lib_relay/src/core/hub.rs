//! # Broadcast Hub
//!
//! The fan-out point between the feed and its subscribers. One payload from
//! the upstream is framed once and handed to every registered downstream peer
//! as the same `Bytes` buffer, so a broadcast never copies the payload per
//! subscriber.
//!
//! ## Delivery rules:
//!
//! 1.  **Snapshot first**: `publish` copies the subscriber list out of the
//!     registry and releases the lock before any write starts. Peers that join
//!     during a broadcast start with the next payload.
//! 2.  **Concurrent, bounded writes**: every peer is written concurrently and
//!     each write is bounded by that peer's own write deadline. A stalled peer
//!     delays nobody but itself.
//! 3.  **Failures are contained**: a failed write is logged and reported in the
//!     [`PublishReport`]. It never aborts the batch, is never retried, and does
//!     not evict the peer. A failed write terminates the peer's handle, and the
//!     subscriber session that owns it unregisters it.

use bytes::Bytes;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::connections::frame::Frame;
use crate::connections::peer::{PeerHandle, PeerId};
use crate::core::registry::Registry;
use crate::error::{PeerError, RelayError};

/// Outcome of a single [`BroadcastHub::publish`].
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Peers in the snapshot.
    pub attempted: usize,
    /// Peers that accepted the payload.
    pub delivered: usize,
    /// Peers whose write failed, with the reason.
    pub failed: Vec<(PeerId, PeerError)>,
}

impl PublishReport {
    /// Whether every peer in the snapshot accepted the payload.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// # Broadcast Hub
///
/// Owns the downstream [`Registry`].
#[derive(Debug, Default)]
pub struct BroadcastHub {
    subscribers: Registry,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Publish
    ///
    /// Writes `payload` to every registered subscriber and waits for all
    /// writes to settle.
    pub async fn publish(&self, payload: Bytes) -> PublishReport {
        let peers = self.subscribers.snapshot();
        let attempted = peers.len();

        let frame = Frame::payload(payload.clone());
        let writes = peers.into_iter().map(|peer| {
            let frame = frame.clone();
            async move {
                let result = peer.send(frame).await;
                (peer, result)
            }
        });

        let mut report = PublishReport {
            attempted,
            ..PublishReport::default()
        };
        for (peer, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    log::warn!("Publish to subscriber {} failed: {}", peer.id(), err);
                    report.failed.push((peer.id().clone(), err));
                }
            }
        }

        log::trace!(
            "Published {} bytes to {}/{} subscribers",
            payload.len(),
            report.delivered,
            report.attempted
        );
        report
    }

    /// Adds a subscriber. Fails with [`RelayError::Conflict`] when the id is
    /// already registered.
    pub fn register(&self, id: PeerId, handle: PeerHandle) -> Result<(), RelayError> {
        self.subscribers.insert(id, handle)
    }

    /// Removes a subscriber without closing it.
    pub fn unregister(&self, id: &PeerId) -> Option<PeerHandle> {
        self.subscribers.delete(id)
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.subscribers.contains(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// # Subscriber Session
    ///
    /// Drives one downstream connection from registration to teardown:
    ///
    /// 1.  Registers `handle` under its own id. On conflict the error is
    ///     returned and the handle is left to the caller.
    /// 2.  Launches the handle under `scope` and answers its heartbeat
    ///     requests with liveness frames.
    /// 3.  Waits until `scope` is cancelled or the connection completes.
    /// 4.  Unregisters and closes the handle.
    ///
    /// Inbound data from subscribers is read and discarded.
    pub async fn serve_subscriber(
        &self,
        handle: PeerHandle,
        scope: &CancellationToken,
    ) -> Result<(), RelayError> {
        let id = handle.id().clone();
        self.register(id.clone(), handle.clone())?;
        log::info!(
            "Subscriber {} connected ({} active)",
            id,
            self.subscriber_count()
        );

        if let Some(mut events) = handle.launch(scope) {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => {
                        log::debug!("Subscriber {} session cancelled", id);
                        break;
                    }
                    _ = &mut events.done => break,
                    Some(()) = events.heartbeats.recv() => {
                        if let Err(err) = handle.send_liveness().await {
                            log::debug!("Subscriber {} liveness failed: {}", id, err);
                        }
                    }
                    Some(err) = events.errors.recv() => {
                        log::warn!("Subscriber {} error: {}", id, err);
                    }
                    Some(_) = events.payloads.recv() => {}
                }
            }
        }

        self.unregister(&id);
        if let Err(err) = handle.close().await {
            log::debug!("Subscriber {} close: {}", id, err);
        }
        log::info!(
            "Subscriber {} disconnected ({} active)",
            id,
            self.subscriber_count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{broken_handle, fast_config, idle_handle, stalled_handle, ws_pair};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_publish_reaches_all_healthy_peers_despite_failure() {
        let hub = BroadcastHub::new();
        for id in 0..4u64 {
            hub.register(PeerId::from(id), idle_handle(id)).unwrap();
        }
        hub.register(PeerId::from(99u64), broken_handle(99u64)).unwrap();

        let report = hub.publish(Bytes::from_static(b"tick")).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PeerId::from(99u64));
        // Failed peers are not evicted by the hub.
        assert!(hub.is_registered(&PeerId::from(99u64)));
    }

    #[tokio::test]
    async fn test_stalled_peer_is_bounded_by_its_deadline() {
        let hub = BroadcastHub::new();
        hub.register(PeerId::from(1u64), idle_handle(1u64)).unwrap();
        hub.register(
            PeerId::from(2u64),
            stalled_handle(2u64, Duration::from_millis(50)),
        )
        .unwrap();

        let report = timeout(Duration::from_secs(2), hub.publish(Bytes::from_static(b"x")))
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(matches!(report.failed[0].1, PeerError::WriteTimeout(_)));
    }

    #[tokio::test]
    async fn test_publish_keeps_payload_kind() {
        use tokio_tungstenite::tungstenite::Message;

        let hub = BroadcastHub::new();
        let mut clients = Vec::new();
        for id in 1..=2u64 {
            let (server, client) = ws_pair().await;
            hub.register(PeerId::from(id), PeerHandle::from_websocket(id, server, fast_config()))
                .unwrap();
            clients.push(client);
        }

        hub.publish(Bytes::from_static(br#"{"p":3}"#)).await;
        hub.publish(Bytes::from_static(&[0x00, 0xff])).await;

        for client in clients.iter_mut() {
            let text = client.next().await.unwrap().unwrap();
            assert_eq!(text, Message::Text(r#"{"p":3}"#.into()));
            let binary = client.next().await.unwrap().unwrap();
            assert_eq!(binary, Message::Binary(Bytes::from_static(&[0x00, 0xff])));
        }
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_is_empty() {
        let hub = BroadcastHub::new();
        let report = hub.publish(Bytes::from_static(b"x")).await;
        assert_eq!(report.attempted, 0);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_duplicate_subscriber_is_rejected() {
        let hub = BroadcastHub::new();
        let scope = CancellationToken::new();
        hub.register(PeerId::from(5u64), idle_handle(5u64)).unwrap();

        let err = hub
            .serve_subscriber(idle_handle(5u64), &scope)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Conflict(PeerId::Numeric(5))));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_session_waits_without_polling_until_cancelled() {
        let hub = BroadcastHub::new();
        let scope = CancellationToken::new();

        let mut session = task::spawn(hub.serve_subscriber(idle_handle(8u64), &scope));
        assert_pending!(session.poll());
        assert!(hub.is_registered(&PeerId::from(8u64)));

        // Let the handle's tasks start; nothing should wake the session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_woken());

        scope.cancel();
        assert!(session.is_woken());

        let result = assert_ready!(session.poll());
        assert!(result.is_ok());
        assert!(!hub.is_registered(&PeerId::from(8u64)));
    }

    #[tokio::test]
    async fn test_session_ends_when_subscriber_disconnects() {
        let hub = Arc::new(BroadcastHub::new());
        let scope = CancellationToken::new();
        let (server, client) = ws_pair().await;
        let handle = PeerHandle::from_websocket(21u64, server, fast_config());

        let session = {
            let hub = Arc::clone(&hub);
            let scope = scope.clone();
            tokio::spawn(async move { hub.serve_subscriber(handle, &scope).await })
        };

        let (_tx, mut rx) = client.split();
        while !hub.is_registered(&PeerId::from(21u64)) {
            tokio::task::yield_now().await;
        }
        hub.publish(Bytes::from_static(br#"{"p":1}"#)).await;
        let msg = rx.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap().as_str(), r#"{"p":1}"#);

        drop(rx);
        drop(_tx);

        let result = timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
