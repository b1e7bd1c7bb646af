//! WebSocket transport.

use crate::error::TransportError;
use crate::transport::{Connection, Connector, FrameSink};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Connects to a server over `ws://` or `wss://`.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn name(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");
        Ok(into_connection(stream))
    }
}

struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::text(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Adapt an established WebSocket (client or server side) into a
/// [`Connection`] of text frames. Binary, ping and pong frames are skipped;
/// a close frame ends the link.
pub fn into_connection<S>(socket: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let stream = stream
        .filter_map(|item| async move {
            match item {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            }
        })
        .boxed();

    Connection {
        sink: Box::new(WebSocketSink { inner: sink }),
        stream,
    }
}
