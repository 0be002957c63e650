//! HTTP front door: index banner, health check and the `/market-price`
//! WebSocket endpoint that turns every accepted socket into a subscriber.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum::body::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use lib_relay::connections::{Frame, FrameSink, FrameStream, WireMessage};
use lib_relay::{BoxError, BroadcastHub, Module, PeerConfig, PeerError, PeerHandle};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub cors_allowed: Vec<String>,
    pub peer: PeerConfig,
}

#[derive(Clone)]
struct GatewayState {
    hub: Arc<BroadcastHub>,
    peer: PeerConfig,
    scope: CancellationToken,
    banner: Arc<str>,
}

pub struct Gateway {
    config: GatewayConfig,
    hub: Arc<BroadcastHub>,
    scope: CancellationToken,
    running: Mutex<()>,
    banner: Arc<str>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, hub: Arc<BroadcastHub>) -> Self {
        let ip = local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            config,
            hub,
            scope: CancellationToken::new(),
            running: Mutex::new(()),
            banner: Arc::from(format!("This is a price feed relay, IP: ({})", ip)),
        }
    }

    pub fn router(&self) -> Router {
        let state = GatewayState {
            hub: Arc::clone(&self.hub),
            peer: self.config.peer.clone(),
            scope: self.scope.clone(),
            banner: Arc::clone(&self.banner),
        };

        Router::new()
            .route("/", get(index_handler))
            .route("/health", get(health_handler))
            .route("/market-price", get(market_price_handler))
            .layer(cors_layer(&self.config.cors_allowed))
            .with_state(state)
    }

    /// Serves on an already bound listener until the gateway is stopped.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let _running = self.running.lock().await;
        log::info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.scope.clone().cancelled_owned())
            .await?;

        log::info!("Gateway server was closed");
        Ok(())
    }
}

impl Module for Gateway {
    fn name(&self) -> &str {
        "gateway"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
            let listener = TcpListener::bind(addr).await?;
            self.serve(listener).await?;
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            // Ends the HTTP server and every subscriber session.
            self.scope.cancel();
            let _stopped = self.running.lock().await;
            Ok(())
        })
    }
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let methods = [
        Method::POST,
        Method::HEAD,
        Method::GET,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
    ];

    if allowed.is_empty() || allowed.iter().any(|origin| origin == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods(methods)
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            header::ACCESS_CONTROL_REQUEST_HEADERS,
            header::ACCESS_CONTROL_REQUEST_METHOD,
        ])
}

async fn index_handler(State(state): State<GatewayState>) -> String {
    state.banner.to_string()
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "success": true }))
}

fn parse_user_id(raw: Option<&str>) -> Result<u64, &'static str> {
    match raw {
        None | Some("") => Err("you have to provide user_id"),
        Some(raw) => raw.parse::<u64>().map_err(|_| "invalid user_id value"),
    }
}

fn bad_request(message: &str) -> Response {
    log::warn!("[api] Error {}", message);
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn market_price_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id = match parse_user_id(params.get("user_id").map(String::as_str)) {
        Ok(user_id) => user_id,
        Err(message) => return bad_request(message),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            log::debug!("Upgrade rejected for user {}: {}", user_id, rejection);
            return bad_request("could not open websocket connection");
        }
    };

    ws.max_message_size(state.peer.max_message_size)
        .on_upgrade(move |socket| subscriber_session(socket, user_id, state))
}

async fn subscriber_session(socket: WebSocket, user_id: u64, state: GatewayState) {
    let (sink, stream) = axum_frames(socket);
    let handle = PeerHandle::new(user_id, sink, stream, state.peer.clone());

    if let Err(err) = state.hub.serve_subscriber(handle.clone(), &state.scope).await {
        log::warn!("Subscriber {} rejected: {}", user_id, err);
        let _ = handle.close().await;
    }
}

/// Adapts an axum socket to the relay's frame sink/stream pair.
fn axum_frames(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e: axum::Error| PeerError::from_boxed(e.into_inner()))
        .with(|frame: Frame| {
            future::ready(Ok::<Message, PeerError>(frame.into_message::<AxumMessage>().0))
        });

    let stream = stream.map(|msg| {
        msg.map(from_axum)
            .map_err(|e| PeerError::from_boxed(e.into_inner()))
    });

    (Box::pin(sink), Box::pin(stream))
}

/// axum's message type on the relay's frame mapping.
struct AxumMessage(Message);

impl WireMessage for AxumMessage {
    type Text = Utf8Bytes;

    fn text(text: Utf8Bytes) -> Self {
        Self(Message::Text(text))
    }

    fn binary(data: Bytes) -> Self {
        Self(Message::Binary(data))
    }

    fn ping(data: Bytes) -> Self {
        Self(Message::Ping(data))
    }

    fn pong(data: Bytes) -> Self {
        Self(Message::Pong(data))
    }

    fn close() -> Self {
        Self(Message::Close(None))
    }
}

fn from_axum(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(Bytes::from(text)),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}
