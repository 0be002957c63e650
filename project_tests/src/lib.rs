//! Harness for end-to-end relay tests: in-memory WebSocket transports and a
//! scripted upstream connector.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use lib_relay::{PeerConfig, PeerError, PeerHandle, RelayError, UpstreamConnector, UPSTREAM_PEER};
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;

pub type MemorySocket = WebSocketStream<DuplexStream>;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Connected WebSocket pair over memory: `(relay side, remote side)`.
///
/// `relay_role` is the role the relay plays on its end, `Role::Client` for an
/// upstream connection and `Role::Server` for a subscriber.
pub async fn socket_pair(relay_role: Role) -> (MemorySocket, MemorySocket) {
    let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
    let remote_role = match relay_role {
        Role::Client => Role::Server,
        Role::Server => Role::Client,
    };
    let relay = WebSocketStream::from_raw_socket(a, relay_role, None).await;
    let remote = WebSocketStream::from_raw_socket(b, remote_role, None).await;
    (relay, remote)
}

/// Upstream socket whose far end is raw bytes, for injecting malformed frames.
pub async fn raw_upstream() -> (MemorySocket, DuplexStream) {
    let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
    let relay = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    (relay, b)
}

/// Short write deadline and a heartbeat that never fires within a test.
pub fn test_peer_config() -> PeerConfig {
    PeerConfig::default()
        .write_wait(Duration::from_millis(250))
        .ping_period(Duration::from_secs(60))
}

/// Hands out pre-built upstream handles in order, then refuses.
#[derive(Default)]
pub struct ScriptedConnector {
    sockets: Mutex<VecDeque<MemorySocket>>,
}

impl ScriptedConnector {
    pub fn new(sockets: Vec<MemorySocket>) -> Self {
        Self {
            sockets: Mutex::new(sockets.into()),
        }
    }
}

impl UpstreamConnector for ScriptedConnector {
    async fn connect(&self) -> Result<PeerHandle, RelayError> {
        let next = self
            .sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(socket) => Ok(PeerHandle::from_websocket(UPSTREAM_PEER, socket, test_peer_config())),
            None => Err(RelayError::Connection(PeerError::Transport(Box::new(
                io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted upstream left"),
            )))),
        }
    }
}

/// Polls `check` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
