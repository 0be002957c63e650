//! # Peer Handle
//!
//! A `PeerHandle` wraps one streaming connection, upstream or downstream, and
//! gives every connection the same lifecycle:
//!
//! 1.  **Created** from an established transport ([`PeerHandle::new`] or
//!     [`PeerHandle::from_websocket`]).
//! 2.  **Launched** once with [`PeerHandle::launch`]. This spawns a read task
//!     and a heartbeat task under a child of the caller's cancellation scope
//!     and hands back the [`PeerEvents`] receivers. A second launch is a no-op.
//! 3.  **Running**: payloads, heartbeat requests and unexpected errors flow out
//!     of the event channels. Whichever task stops first cancels the other.
//! 4.  **Done**: once both tasks exited and a closing frame was attempted, the
//!     one-shot `done` signal fires.
//! 5.  **Closed** with [`PeerHandle::close`], which is idempotent.
//!
//! All writes go through a single async mutex around the sink, each bounded by
//! the configured write deadline, so a connection never has two concurrent
//! writers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::frame::{self, Frame, FrameSink, FrameStream};
use crate::error::PeerError;

/// Capacity of the error queue. Errors are rare and the read task stops after
/// the first one, so a handful of slots is plenty.
const ERROR_BUFFER: usize = 8;

/// # Peer Identity
///
/// Opaque key of a peer inside a registry. The upstream feed uses a well-known
/// name, subscribers use their numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// A named peer, e.g. the upstream feed.
    Named(String),
    /// A numeric peer, e.g. a subscriber's `user_id`.
    Numeric(u64),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Named(name) => f.write_str(name),
            PeerId::Numeric(id) => write!(f, "{}", id),
        }
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId::Numeric(id)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        PeerId::Named(name.to_string())
    }
}

impl From<String> for PeerId {
    fn from(name: String) -> Self {
        PeerId::Named(name)
    }
}

/// # Peer Configuration
///
/// Timing and buffering knobs shared by every handle built from it.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Deadline for a single frame write (payload, liveness or close).
    pub write_wait: Duration,
    /// Interval between heartbeat requests.
    pub ping_period: Duration,
    /// Capacity of the inbound payload queue.
    pub payload_buffer: usize,
    /// Largest inbound message accepted by the transport, in bytes.
    pub max_message_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(5 * 60),
            payload_buffer: 64,
            max_message_size: 1024 * 100,
        }
    }
}

impl PeerConfig {
    /// Set the write deadline
    pub fn write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// Set the heartbeat interval
    pub fn ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    /// Set the payload queue capacity (at least 1)
    pub fn payload_buffer(mut self, capacity: usize) -> Self {
        self.payload_buffer = capacity.max(1);
        self
    }

    /// Set the inbound message size limit
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}

/// # Peer Events
///
/// The receiving ends of a launched handle. The consumer must keep draining
/// `payloads`; a full queue holds the read task back.
#[derive(Debug)]
pub struct PeerEvents {
    /// Inbound data frames. Closed when the read task ends.
    pub payloads: mpsc::Receiver<Bytes>,
    /// Unexpected read failures and failures writing the closing frame.
    pub errors: mpsc::Receiver<PeerError>,
    /// One tick per `ping_period`; answer with [`PeerHandle::send_liveness`].
    pub heartbeats: mpsc::Receiver<()>,
    /// Fires once both tasks exited.
    pub done: oneshot::Receiver<()>,
}

struct PeerInner {
    id: PeerId,
    config: PeerConfig,
    writer: tokio::sync::Mutex<FrameSink>,
    /// Present until the handle is launched or closed.
    reader: Mutex<Option<FrameStream>>,
    /// Scope of the running tasks, set by `launch`.
    scope: OnceLock<CancellationToken>,
    /// Error queue sender kept for writes made by the run task.
    errors: OnceLock<mpsc::Sender<PeerError>>,
    closed: AtomicBool,
}

/// # Peer Handle
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerHandle {
    /// Wraps an established transport.
    pub fn new(id: impl Into<PeerId>, sink: FrameSink, stream: FrameStream, config: PeerConfig) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: id.into(),
                config,
                writer: tokio::sync::Mutex::new(sink),
                reader: Mutex::new(Some(stream)),
                scope: OnceLock::new(),
                errors: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wraps a tungstenite WebSocket.
    pub fn from_websocket<S>(id: impl Into<PeerId>, ws: WebSocketStream<S>, config: PeerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = frame::websocket(ws);
        Self::new(id, sink, stream, config)
    }

    /// The immutable identity of this peer.
    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// # Launch
    ///
    /// Starts the read and heartbeat tasks under a child of `scope` and returns
    /// the event receivers. Only the first call on a live handle does anything;
    /// later calls, or a call after `close`, return `None`.
    pub fn launch(&self, scope: &CancellationToken) -> Option<PeerEvents> {
        let stream = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let scope = scope.child_token();
        // `reader` was still present, so this is the only launch.
        let _ = self.inner.scope.set(scope.clone());
        if self.is_closed() {
            scope.cancel();
        }

        let (payload_tx, payloads) = mpsc::channel(self.inner.config.payload_buffer.max(1));
        let (error_tx, errors) = mpsc::channel(ERROR_BUFFER);
        let (heartbeat_tx, heartbeats) = mpsc::channel(1);
        let (done_tx, done) = oneshot::channel();
        let _ = self.inner.errors.set(error_tx.clone());

        log::debug!("Peer {} launched", self.inner.id);

        let handle = self.clone();
        tokio::spawn(async move {
            handle
                .run(stream, scope, payload_tx, error_tx, heartbeat_tx, done_tx)
                .await;
        });

        Some(PeerEvents {
            payloads,
            errors,
            heartbeats,
            done,
        })
    }

    async fn run(
        self,
        stream: FrameStream,
        scope: CancellationToken,
        payload_tx: mpsc::Sender<Bytes>,
        error_tx: mpsc::Sender<PeerError>,
        heartbeat_tx: mpsc::Sender<()>,
        done_tx: oneshot::Sender<()>,
    ) {
        let read = async {
            self.read_loop(stream, &scope, payload_tx, error_tx).await;
            scope.cancel();
        };
        let heartbeat = async {
            self.heartbeat_loop(&scope, heartbeat_tx).await;
            scope.cancel();
        };
        tokio::join!(read, heartbeat);

        if !self.is_closed() {
            if let Err(err) = self.write_frame(Frame::Close).await {
                self.surface(err);
            }
        }

        log::debug!("Peer {} finished", self.inner.id);
        let _ = done_tx.send(());
    }

    async fn read_loop(
        &self,
        mut stream: FrameStream,
        scope: &CancellationToken,
        payload_tx: mpsc::Sender<Bytes>,
        error_tx: mpsc::Sender<PeerError>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Frame::Close)) => {
                    log::debug!("Peer {} sent a close frame", self.inner.id);
                    return;
                }
                Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => {
                    // Pongs to inbound pings are queued by tungstenite itself.
                    log::trace!("Peer {} liveness frame received", self.inner.id);
                }
                Some(Ok(data)) => {
                    let Some(payload) = data.into_payload() else {
                        continue;
                    };
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => return,
                        // A dropped receiver only means nobody wants the
                        // payloads; keep reading to notice the disconnect.
                        _ = payload_tx.send(payload) => {}
                    }
                }
                Some(Err(err)) => {
                    if err.is_normal_close() {
                        log::debug!("Peer {} connection closed", self.inner.id);
                    } else {
                        log::warn!("Peer {} read error: {}", self.inner.id, err);
                        tokio::select! {
                            biased;
                            _ = scope.cancelled() => {}
                            _ = error_tx.send(err) => {}
                        }
                    }
                    return;
                }
                None => {
                    log::debug!("Peer {} stream ended", self.inner.id);
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(&self, scope: &CancellationToken, heartbeat_tx: mpsc::Sender<()>) {
        let period = self.inner.config.ping_period;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => return,
                        _ = heartbeat_tx.send(()) => {}
                    }
                }
            }
        }
    }

    /// Writes a payload as a data frame.
    pub async fn send_payload(&self, payload: Bytes) -> Result<(), PeerError> {
        self.send(Frame::payload(payload)).await
    }

    /// Writes a liveness frame (an unsolicited pong).
    pub async fn send_liveness(&self) -> Result<(), PeerError> {
        self.send(Frame::Pong(Bytes::new())).await
    }

    /// # Send
    ///
    /// Writes one frame through the exclusive write path. Any failure is
    /// returned to the caller and terminates the handle.
    pub async fn send(&self, frame: Frame) -> Result<(), PeerError> {
        let result = self.write_frame(frame).await;
        if let Err(err) = &result {
            log::debug!("Peer {} write failed: {}", self.inner.id, err);
            self.terminate();
        }
        result
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        let wait = self.inner.config.write_wait;
        let mut sink = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        match time::timeout(wait, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::WriteTimeout(wait)),
        }
    }

    /// Pushes an error onto the error queue unless it is a normal close.
    fn surface(&self, err: PeerError) {
        if err.is_normal_close() {
            return;
        }
        log::warn!("Peer {} error: {}", self.inner.id, err);
        if let Some(tx) = self.inner.errors.get() {
            let _ = tx.try_send(err);
        }
    }

    /// Cancels the background tasks without waiting for them. The run task
    /// still sends the closing frame and fires `done` on its own.
    pub(crate) fn terminate(&self) {
        if let Some(scope) = self.inner.scope.get() {
            scope.cancel();
        }
    }

    /// # Close
    ///
    /// Stops the background tasks (which closes the payload queue) and closes
    /// the underlying connection. Safe to call any number of times, before or
    /// after launch, and after the connection already failed.
    pub async fn close(&self) -> Result<(), PeerError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.terminate();
        drop(
            self.inner
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let wait = self.inner.config.write_wait;
        let mut sink = self.inner.writer.lock().await;
        let result = match time::timeout(wait, sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_normal_close() => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PeerError::WriteTimeout(wait)),
        };

        log::debug!("Peer {} closed", self.inner.id);
        result
    }
}
