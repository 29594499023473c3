/// Stream transport
///
/// `FeedTransport` moves text frames; `WsTransport` is the WebSocket
/// implementation. `StreamClient` layers the subscribe handshake and a
/// time-bounded, decoded receive on top of any transport.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::decoder::{DecodeError, Decoder, FeedMessage, MessageBody};
use crate::protocol::SubscribeRequest;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Closed,

    #[error("no message received for {0:?}")]
    Idle(Duration),

    #[error("subscription not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("failed to encode subscribe request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A bidirectional text-frame channel to the feed
#[async_trait]
pub trait FeedTransport: Send {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame, or `None` once the peer has closed the stream
    async fn next_text(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        WsTransport { stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        let (stream, response) =
            connect_async(url)
                .await
                .map_err(|source| TransportError::Connect {
                    url: url.to_string(),
                    source,
                })?;
        info!(url, status = %response.status(), "websocket connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Ping(data))) => {
                    debug!("received ping, sending pong");
                    stream.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "websocket closed by server");
                    return Ok(None);
                }
                // binary, pong and raw frames carry nothing for the book
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One received frame: its size and what it decoded to
#[derive(Debug)]
pub struct Frame {
    pub raw_len: usize,
    pub decoded: Result<FeedMessage, DecodeError>,
}

/// Subscribes to one product's channels and hands out decoded frames
pub struct StreamClient<T> {
    transport: T,
    url: String,
    request: SubscribeRequest,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    subscribed: bool,
}

impl<T: FeedTransport> StreamClient<T> {
    pub fn new(transport: T, config: &FeedConfig) -> Self {
        StreamClient {
            transport,
            url: config.ws_url.clone(),
            request: SubscribeRequest::new(config.product_ids(), config.channels.clone()),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            subscribed: false,
        }
    }

    /// Connect, send the subscribe request and wait for the acknowledgement.
    /// Frames are only handed out by `receive` after this succeeds.
    pub async fn subscribe(&mut self) -> Result<(), TransportError> {
        self.subscribed = false;
        self.transport.connect(&self.url).await?;

        let request = serde_json::to_string(&self.request)?;
        self.transport.send_text(request).await?;

        let limit = self.handshake_timeout;
        match tokio::time::timeout(limit, self.await_ack()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::HandshakeTimeout(limit)),
        }

        info!(
            products = ?self.request.product_ids,
            channels = ?self.request.channels,
            "subscription acknowledged"
        );
        self.subscribed = true;
        Ok(())
    }

    async fn await_ack(&mut self) -> Result<(), TransportError> {
        loop {
            let text = self
                .transport
                .next_text()
                .await?
                .ok_or(TransportError::Closed)?;
            match Decoder::decode(&text) {
                Ok(FeedMessage {
                    body: MessageBody::Subscriptions,
                    ..
                }) => return Ok(()),
                Ok(FeedMessage {
                    body: MessageBody::Error { message },
                    ..
                }) => return Err(TransportError::Rejected(message)),
                Ok(other) => debug!(kind = other.kind(), "message before subscription ack"),
                Err(e) => warn!(error = %e, "undecodable message before subscription ack"),
            }
        }
    }

    /// Wait for the next frame, bounded by the idle timeout
    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        if !self.subscribed {
            return Err(TransportError::NotConnected);
        }
        let limit = self.idle_timeout;
        let text = match tokio::time::timeout(limit, self.transport.next_text()).await {
            Ok(result) => result?.ok_or(TransportError::Closed)?,
            Err(_) => return Err(TransportError::Idle(limit)),
        };
        Ok(Frame {
            raw_len: text.len(),
            decoded: Decoder::decode(&text),
        })
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.subscribed = false;
        self.transport.close().await
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }
}
