//! # Feed Supervisor
//!
//! Owns the single upstream connection and drives it through one session:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Closing -> Disconnected
//! ```
//!
//! While `Streaming`, every payload read from the upstream is published to the
//! [`BroadcastHub`] before the next one is taken, so subscribers see payloads
//! in upstream order. Heartbeat requests and the idle refresh timer are both
//! answered with a liveness frame. Any failure ends the session; the
//! supervisor never reconnects on its own. Retrying is the owner's job (see
//! [`crate::lifecycle::feed`]).

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connections::peer::{PeerEvents, PeerHandle, PeerId};
use crate::core::hub::BroadcastHub;
use crate::core::registry::Registry;
use crate::error::{PeerError, RelayError};

/// Registry key of the upstream connection.
pub const UPSTREAM_PEER: &str = "mp_ws_connection";

/// Dials the upstream feed.
pub trait UpstreamConnector: Send + Sync {
    /// Opens a fresh, not yet launched upstream handle.
    fn connect(&self) -> impl Future<Output = Result<PeerHandle, RelayError>> + Send;
}

/// Observable state of the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Streaming,
    Closing,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedState::Disconnected => "disconnected",
            FeedState::Connecting => "connecting",
            FeedState::Streaming => "streaming",
            FeedState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why a streaming session ended.
#[derive(Debug)]
pub enum FeedExit {
    /// The caller's scope was cancelled.
    Cancelled,
    /// The upstream reported a read failure.
    UpstreamError(PeerError),
    /// Answering a heartbeat or refresh tick failed.
    HeartbeatWriteFailed(PeerError),
    /// The upstream closed the connection normally.
    Completed,
}

impl FeedExit {
    /// Whether the session ended because something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FeedExit::UpstreamError(_) | FeedExit::HeartbeatWriteFailed(_)
        )
    }
}

impl fmt::Display for FeedExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedExit::Cancelled => f.write_str("cancelled"),
            FeedExit::UpstreamError(err) => write!(f, "upstream error: {}", err),
            FeedExit::HeartbeatWriteFailed(err) => write!(f, "heartbeat write failed: {}", err),
            FeedExit::Completed => f.write_str("upstream closed"),
        }
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Interval of the unconditional liveness frame sent to the upstream.
    pub refresh_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl FeedConfig {
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

/// # Feed Supervisor
pub struct FeedSupervisor<C> {
    connector: C,
    hub: Arc<BroadcastHub>,
    config: FeedConfig,
    upstream_id: PeerId,
    /// Holds at most the upstream handle.
    upstream: Registry,
    running: AtomicBool,
    state: watch::Sender<FeedState>,
}

impl<C: UpstreamConnector> FeedSupervisor<C> {
    pub fn new(connector: C, hub: Arc<BroadcastHub>, config: FeedConfig) -> Self {
        let (state, _) = watch::channel(FeedState::Disconnected);
        Self {
            connector,
            hub,
            config,
            upstream_id: PeerId::from(UPSTREAM_PEER),
            upstream: Registry::new(),
            running: AtomicBool::new(false),
            state,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Whether an upstream handle is currently held.
    pub fn is_connected(&self) -> bool {
        self.upstream.contains(&self.upstream_id)
    }

    fn set_state(&self, next: FeedState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("Feed state {} -> {}", prev, next);
        }
    }

    /// # Start
    ///
    /// Runs one upstream session and returns why it ended. Only one session
    /// can run at a time; a concurrent call fails with
    /// [`RelayError::Conflict`]. A failed dial is returned as an error after
    /// the state is back to `Disconnected`.
    ///
    /// Dropping the returned future mid-session also tears the session down:
    /// the upstream handle is terminated and removed, and the state goes back
    /// to `Disconnected`, so a later `start` can run.
    pub async fn start(&self, scope: &CancellationToken) -> Result<FeedExit, RelayError> {
        if self.is_connected() || self.running.swap(true, Ordering::AcqRel) {
            return Err(RelayError::Conflict(self.upstream_id.clone()));
        }

        let _session = SessionGuard { supervisor: self };
        self.session(scope).await
    }

    async fn session(&self, scope: &CancellationToken) -> Result<FeedExit, RelayError> {
        self.set_state(FeedState::Connecting);
        log::info!("Connecting upstream {}", self.upstream_id);

        let connected = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(FeedExit::Cancelled),
            connected = self.connector.connect() => connected,
        };
        let handle = match connected {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("Upstream {} connect failed: {}", self.upstream_id, err);
                return Err(err);
            }
        };

        if let Err(err) = self.upstream.insert(self.upstream_id.clone(), handle.clone()) {
            let _ = handle.close().await;
            return Err(err);
        }

        let exit = match handle.launch(scope) {
            Some(events) => {
                self.set_state(FeedState::Streaming);
                log::info!("Upstream {} streaming", self.upstream_id);
                self.dispatch(&handle, events, scope).await
            }
            None => FeedExit::Completed,
        };

        self.set_state(FeedState::Closing);
        if let Err(err) = handle.close().await {
            log::debug!("Upstream {} close: {}", self.upstream_id, err);
        }
        self.upstream.delete(&self.upstream_id);

        if exit.is_failure() {
            log::warn!("Upstream {} session ended: {}", self.upstream_id, exit);
        } else {
            log::info!("Upstream {} session ended: {}", self.upstream_id, exit);
        }
        Ok(exit)
    }

    async fn dispatch(
        &self,
        handle: &PeerHandle,
        mut events: PeerEvents,
        scope: &CancellationToken,
    ) -> FeedExit {
        let period = self.config.refresh_interval;
        let mut refresh = time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return FeedExit::Cancelled,
                payload = events.payloads.recv() => match payload {
                    Some(payload) => {
                        self.hub.publish(payload).await;
                    }
                    // The read task queues its error before the payload queue closes.
                    None => {
                        return match events.errors.try_recv() {
                            Ok(err) => FeedExit::UpstreamError(err),
                            Err(_) => FeedExit::Completed,
                        };
                    }
                },
                Some(err) = events.errors.recv() => return FeedExit::UpstreamError(err),
                Some(()) = events.heartbeats.recv() => {
                    if let Err(err) = handle.send_liveness().await {
                        return FeedExit::HeartbeatWriteFailed(err);
                    }
                }
                _ = refresh.tick() => {
                    log::debug!("Upstream {} refresh", self.upstream_id);
                    if let Err(err) = handle.send_liveness().await {
                        return FeedExit::HeartbeatWriteFailed(err);
                    }
                }
                _ = &mut events.done => return FeedExit::Completed,
            }
        }
    }
}

/// Resets the supervisor when a session ends, whether `start` returned or its
/// future was dropped.
struct SessionGuard<'a, C> {
    supervisor: &'a FeedSupervisor<C>,
}

impl<C> Drop for SessionGuard<'_, C> {
    fn drop(&mut self) {
        let supervisor = self.supervisor;
        if let Some(handle) = supervisor.upstream.delete(&supervisor.upstream_id) {
            log::warn!("Upstream {} session abandoned, terminating", supervisor.upstream_id);
            handle.terminate();
        }

        let prev = supervisor.state.send_replace(FeedState::Disconnected);
        if prev != FeedState::Disconnected {
            log::debug!("Feed state {} -> {}", prev, FeedState::Disconnected);
        }
        supervisor.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{broken_handle, fast_config, idle_handle, ws_pair};
    use crate::connections::peer::PeerConfig;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct QueuedConnector {
        handles: Mutex<VecDeque<Result<PeerHandle, RelayError>>>,
    }

    impl QueuedConnector {
        fn new(handles: Vec<Result<PeerHandle, RelayError>>) -> Self {
            Self {
                handles: Mutex::new(handles.into()),
            }
        }
    }

    impl UpstreamConnector for QueuedConnector {
        async fn connect(&self) -> Result<PeerHandle, RelayError> {
            let next = self.handles.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(refused()))
        }
    }

    fn refused() -> RelayError {
        RelayError::Connection(PeerError::Transport(Box::new(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        ))))
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let hub = Arc::new(BroadcastHub::new());
        let supervisor = FeedSupervisor::new(
            QueuedConnector::new(vec![Err(refused())]),
            hub,
            FeedConfig::default(),
        );
        let mut states = supervisor.subscribe_state();

        let err = supervisor.start(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RelayError::Connection(_)));
        assert_eq!(supervisor.state(), FeedState::Disconnected);
        assert!(!supervisor.is_connected());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), FeedState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_while_streaming() {
        let hub = Arc::new(BroadcastHub::new());
        let supervisor = Arc::new(FeedSupervisor::new(
            QueuedConnector::new(vec![Ok(idle_handle(UPSTREAM_PEER))]),
            hub,
            FeedConfig::default(),
        ));
        let scope = CancellationToken::new();
        let mut states = supervisor.subscribe_state();

        let run = {
            let supervisor = Arc::clone(&supervisor);
            let scope = scope.clone();
            tokio::spawn(async move { supervisor.start(&scope).await })
        };

        states
            .wait_for(|state| *state == FeedState::Streaming)
            .await
            .unwrap();
        assert!(supervisor.is_connected());

        // A second session is refused while the first is live.
        let err = supervisor.start(&scope).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(PeerId::Named(_))));

        scope.cancel();
        let exit = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert!(matches!(exit, Ok(FeedExit::Cancelled)));
        assert_eq!(supervisor.state(), FeedState::Disconnected);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn test_payloads_are_published_in_order() {
        let hub = Arc::new(BroadcastHub::new());
        let (server, mut upstream) = ws_pair().await;
        let (ours, mut subscriber) = ws_pair().await;
        hub.register(
            PeerId::from(1u64),
            PeerHandle::from_websocket(1u64, ours, fast_config()),
        )
        .unwrap();

        let supervisor = FeedSupervisor::new(
            QueuedConnector::new(vec![Ok(PeerHandle::from_websocket(
                UPSTREAM_PEER,
                server,
                fast_config(),
            ))]),
            Arc::clone(&hub),
            FeedConfig::default(),
        );

        let feed = async {
            use futures_util::SinkExt;
            use tokio_tungstenite::tungstenite::Message;
            for p in 1..=3 {
                let text = format!(r#"{{"p":{}}}"#, p);
                upstream.send(Message::Text(text.into())).await.unwrap();
            }
            upstream.close(None).await.unwrap();
        };

        let scope = CancellationToken::new();
        let (exit, ()) = tokio::join!(supervisor.start(&scope), feed);
        assert!(matches!(exit, Ok(FeedExit::Completed)));

        use futures_util::StreamExt;
        for p in 1..=3 {
            let msg = subscriber.next().await.unwrap().unwrap();
            assert_eq!(msg.into_text().unwrap().as_str(), format!(r#"{{"p":{}}}"#, p));
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_session() {
        let hub = Arc::new(BroadcastHub::new());
        let supervisor = FeedSupervisor::new(
            QueuedConnector::new(vec![Ok(broken_handle(UPSTREAM_PEER))]),
            hub,
            FeedConfig::default().refresh_interval(Duration::from_millis(20)),
        );

        let exit = timeout(
            Duration::from_secs(2),
            supervisor.start(&CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(exit, Ok(FeedExit::HeartbeatWriteFailed(_))));
        assert_eq!(supervisor.state(), FeedState::Disconnected);
    }

    #[tokio::test]
    async fn test_dropped_start_resets_for_restart() {
        let hub = Arc::new(BroadcastHub::new());
        let (server, mut upstream) = ws_pair().await;
        let supervisor = FeedSupervisor::new(
            QueuedConnector::new(vec![
                Ok(PeerHandle::from_websocket(UPSTREAM_PEER, server, fast_config())),
                Ok(idle_handle(UPSTREAM_PEER)),
            ]),
            hub,
            FeedConfig::default(),
        );
        let scope = CancellationToken::new();

        // The owner gives up on a live session.
        let abandoned = timeout(Duration::from_millis(50), supervisor.start(&scope)).await;
        assert!(abandoned.is_err());

        assert_eq!(supervisor.state(), FeedState::Disconnected);
        assert!(!supervisor.is_connected());

        // The abandoned connection is closed rather than left reading.
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;
        let closing = timeout(Duration::from_secs(2), upstream.next()).await.unwrap();
        assert!(matches!(closing, Some(Ok(Message::Close(_))) | None));

        // A fresh session can start.
        let mut states = supervisor.subscribe_state();
        let restart = async {
            states
                .wait_for(|state| *state == FeedState::Streaming)
                .await
                .unwrap();
            scope.cancel();
        };
        let (exit, ()) = tokio::join!(supervisor.start(&scope), restart);
        assert!(matches!(exit, Ok(FeedExit::Cancelled)));
        assert_eq!(supervisor.state(), FeedState::Disconnected);
    }

    /// Streams against an in-memory upstream and returns the first frame the
    /// upstream reads.
    async fn first_frame_from_relay(peer: PeerConfig, feed: FeedConfig) -> tokio_tungstenite::tungstenite::Message {
        use futures_util::StreamExt;

        let hub = Arc::new(BroadcastHub::new());
        let (server, mut upstream) = ws_pair().await;
        let supervisor = FeedSupervisor::new(
            QueuedConnector::new(vec![Ok(PeerHandle::from_websocket(UPSTREAM_PEER, server, peer))]),
            hub,
            feed,
        );
        let scope = CancellationToken::new();

        let observe = async {
            let msg = timeout(Duration::from_secs(2), upstream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            scope.cancel();
            msg
        };
        let (exit, msg) = tokio::join!(supervisor.start(&scope), observe);
        assert!(matches!(exit, Ok(FeedExit::Cancelled)));
        msg
    }

    #[tokio::test]
    async fn test_heartbeat_request_is_answered_upstream() {
        use tokio_tungstenite::tungstenite::Message;

        let msg = first_frame_from_relay(
            fast_config().ping_period(Duration::from_millis(30)),
            FeedConfig::default(),
        )
        .await;
        assert!(matches!(msg, Message::Pong(_)));
    }

    #[tokio::test]
    async fn test_refresh_tick_sends_liveness_upstream() {
        use tokio_tungstenite::tungstenite::Message;

        let msg = first_frame_from_relay(
            fast_config(),
            FeedConfig::default().refresh_interval(Duration::from_millis(30)),
        )
        .await;
        assert!(matches!(msg, Message::Pong(_)));
    }
}
