//! # Price Feed WSS Connector
//!
//! Dials the upstream mark-price WebSocket and wraps the stream in a
//! [`PeerHandle`] ready for the [`FeedSupervisor`](crate::core::FeedSupervisor).

use std::io;
use std::time::Duration;

use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::connections::peer::{PeerConfig, PeerHandle};
use crate::core::supervisor::{UpstreamConnector, UPSTREAM_PEER};
use crate::error::{PeerError, RelayError};

/// Default upstream: all-symbol mark price stream.
pub const DEFAULT_FEED_URL: &str = "wss://fstream.binance.com/ws/!markPrice@arr";

/// Configuration for the upstream WebSocket.
#[derive(Debug, Clone)]
pub struct WssConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub peer: PeerConfig,
}

impl Default for WssConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            peer: PeerConfig::default(),
        }
    }
}

/// Production [`UpstreamConnector`] over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WssConnector {
    config: WssConfig,
}

impl WssConnector {
    pub fn new(config: WssConfig) -> Self {
        Self { config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn socket_config(&self) -> WebSocketConfig {
        let limit = self.config.peer.max_message_size;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(limit);
        ws_config.max_frame_size = Some(limit);
        ws_config
    }
}

impl UpstreamConnector for WssConnector {
    async fn connect(&self) -> Result<PeerHandle, RelayError> {
        log::info!("Connecting to feed WSS: {}", self.config.url);

        let dial = connect_async_with_config(
            self.config.url.as_str(),
            Some(self.socket_config()),
            false,
        );
        let (ws_stream, response) = match tokio::time::timeout(self.config.connect_timeout, dial).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(tungstenite::Error::Url(e))) => {
                return Err(RelayError::configuration(format!(
                    "invalid feed url {}: {}",
                    self.config.url, e
                )));
            }
            Ok(Err(e)) => return Err(RelayError::Connection(PeerError::from(e))),
            Err(_) => {
                let timed_out = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no handshake within {:?}", self.config.connect_timeout),
                );
                return Err(RelayError::Connection(PeerError::Transport(Box::new(timed_out))));
            }
        };

        log::info!("Feed WSS connected (HTTP {})", response.status());
        Ok(PeerHandle::from_websocket(
            UPSTREAM_PEER,
            ws_stream,
            self.config.peer.clone(),
        ))
    }
}
