//! # Wire Frames and Transport Adapters
//!
//! A [`PeerHandle`](super::peer::PeerHandle) does not care which WebSocket
//! implementation sits underneath it. It talks in [`Frame`]s through a boxed
//! sink and a boxed stream. This module defines the frame type and the adapter
//! that turns a `tokio_tungstenite::WebSocketStream` into that pair.
//!
//! Payload bytes are carried as `bytes::Bytes`, so one upstream message can be
//! handed to every subscriber without copying it.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::WebSocketStream;

use crate::error::PeerError;

/// Write half of a peer transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = PeerError> + Send>>;

/// Read half of a peer transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, PeerError>> + Send>>;

/// A single WebSocket frame as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text payload (market snapshots arrive as JSON text).
    Text(Bytes),
    /// A binary payload.
    Binary(Bytes),
    /// Liveness request.
    Ping(Bytes),
    /// Liveness answer.
    Pong(Bytes),
    /// Closing handshake.
    Close,
}

impl Frame {
    /// Returns the payload carried by a data frame, `None` for control frames.
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Frame::Text(data) | Frame::Binary(data) => Some(data),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close => None,
        }
    }

    /// Builds the frame used to forward a payload downstream.
    ///
    /// Payloads are relayed as text when they are valid UTF-8 and as binary
    /// otherwise.
    pub fn payload(data: Bytes) -> Self {
        if std::str::from_utf8(&data).is_ok() {
            Frame::Text(data)
        } else {
            Frame::Binary(data)
        }
    }

    /// Converts a tungstenite message. Raw `Frame` messages never surface from
    /// a reader and map to `None`.
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Frame::Text(Bytes::from(text))),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Ping(data) => Some(Frame::Ping(data)),
            Message::Pong(data) => Some(Frame::Pong(data)),
            Message::Close(_) => Some(Frame::Close),
            Message::Frame(_) => None,
        }
    }
}

/// Message constructors of a WebSocket library, so every transport maps
/// frames onto the wire the same way through [`Frame::into_message`].
pub trait WireMessage: Sized {
    /// The library's validated UTF-8 buffer.
    type Text: TryFrom<Bytes>;

    fn text(text: Self::Text) -> Self;
    fn binary(data: Bytes) -> Self;
    fn ping(data: Bytes) -> Self;
    fn pong(data: Bytes) -> Self;
    fn close() -> Self;
}

impl Frame {
    /// Maps the frame onto a transport message without copying the payload.
    /// A text frame whose bytes are not UTF-8 goes out as binary.
    pub fn into_message<M: WireMessage>(self) -> M {
        match self {
            Frame::Text(data) => match M::Text::try_from(data.clone()) {
                Ok(text) => M::text(text),
                Err(_) => M::binary(data),
            },
            Frame::Binary(data) => M::binary(data),
            Frame::Ping(data) => M::ping(data),
            Frame::Pong(data) => M::pong(data),
            Frame::Close => M::close(),
        }
    }
}

impl WireMessage for Message {
    type Text = Utf8Bytes;

    fn text(text: Utf8Bytes) -> Self {
        Message::Text(text)
    }

    fn binary(data: Bytes) -> Self {
        Message::Binary(data)
    }

    fn ping(data: Bytes) -> Self {
        Message::Ping(data)
    }

    fn pong(data: Bytes) -> Self {
        Message::Pong(data)
    }

    fn close() -> Self {
        Message::Close(None)
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        frame.into_message()
    }
}

/// Splits a tungstenite WebSocket into the boxed sink/stream pair a peer
/// handle owns.
pub fn websocket<S>(ws: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(PeerError::from)
        .with(|frame: Frame| future::ready(Ok::<Message, PeerError>(Message::from(frame))));

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => Frame::from_message(msg).map(Ok),
            Err(e) => Some(Err(PeerError::from(e))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}
