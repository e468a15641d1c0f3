//! WebSocket client transport for the control channel.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use runner_shell_core::{Channel, Envelope, Transport, TransportError};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

use crate::protocol::{decode, encode};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the control peer with a bearer credential.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    token: String,
}

impl WebSocketTransport {
    /// Create a transport for `url`; an empty `token` sends no
    /// `Authorization` header.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Channel = WebSocketChannel;

    async fn connect(&self) -> Result<WebSocketChannel, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if !self.token.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| TransportError::Connection(format!("invalid credential: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        tracing::debug!(url = %self.url, status = %response.status(), "WebSocket connected");

        let (writer, reader) = stream.split();
        Ok(WebSocketChannel {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
        })
    }
}

/// An open WebSocket control channel.
pub struct WebSocketChannel {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Send("channel closed".into()));
        }
        let frame = encode(envelope)?;
        self.writer
            .lock()
            .await
            .send(Message::text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn receive(&self) -> Result<Envelope, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }

        let mut reader = self.reader.lock().await;
        loop {
            let frame = match reader.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => String::from_utf8(data.to_vec())
                    .map_err(|e| TransportError::Decode(e.to_string()))?,
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "Peer closed WebSocket");
                    return Err(TransportError::ChannelClosed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {e}");
                    return Err(TransportError::ChannelClosed);
                }
                None => return Err(TransportError::ChannelClosed),
            };
            return decode(&frame);
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.writer.lock().await.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(tungstenite::Error::Io(e)) => {
                tracing::debug!("WebSocket already torn down: {e}");
                Ok(())
            }
            Err(e) => Err(TransportError::Send(format!("close failed: {e}"))),
        }
    }
}
