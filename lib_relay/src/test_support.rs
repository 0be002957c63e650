//! Helpers shared by the unit tests.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{sink, stream, Sink};
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::connections::frame::Frame;
use crate::connections::peer::{PeerConfig, PeerHandle, PeerId};
use crate::error::PeerError;

/// Connected in-memory WebSocket pair: `(server side, client side)`.
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (server, client)
}

/// Short deadlines so failing paths resolve quickly in tests.
pub fn fast_config() -> PeerConfig {
    PeerConfig::default()
        .write_wait(Duration::from_millis(200))
        .ping_period(Duration::from_secs(60))
}

/// A handle whose transport never produces frames and accepts every write.
pub fn idle_handle(id: impl Into<PeerId>) -> PeerHandle {
    let sink = sink::unfold((), |_, _frame: Frame| async move { Ok::<(), PeerError>(()) });
    PeerHandle::new(
        id,
        Box::pin(sink),
        Box::pin(stream::pending::<Result<Frame, PeerError>>()),
        fast_config(),
    )
}

/// A handle whose every write fails with a broken pipe.
pub fn broken_handle(id: impl Into<PeerId>) -> PeerHandle {
    PeerHandle::new(
        id,
        Box::pin(BrokenSink),
        Box::pin(stream::pending::<Result<Frame, PeerError>>()),
        fast_config(),
    )
}

struct BrokenSink;

fn broken_pipe() -> PeerError {
    PeerError::Transport(Box::new(io::Error::from(io::ErrorKind::BrokenPipe)))
}

impl Sink<Frame> for BrokenSink {
    type Error = PeerError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), PeerError>> {
        Poll::Ready(Err(broken_pipe()))
    }

    fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), PeerError> {
        Err(broken_pipe())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), PeerError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), PeerError>> {
        Poll::Ready(Ok(()))
    }
}

/// A handle whose writes never complete.
pub fn stalled_handle(id: impl Into<PeerId>, write_wait: Duration) -> PeerHandle {
    let sink = sink::unfold((), |_, _frame: Frame| async move {
        std::future::pending::<()>().await;
        Ok::<(), PeerError>(())
    });
    PeerHandle::new(
        id,
        Box::pin(sink),
        Box::pin(stream::pending::<Result<Frame, PeerError>>()),
        fast_config().write_wait(write_wait),
    )
}
