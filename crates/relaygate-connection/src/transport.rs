//! Frame transport traits for physical relay connections
//!
//! A physical connection is split into a [`FrameSink`] and a [`FrameSource`]
//! so both directions of a relay can be pumped concurrently. Implementations
//! are provided for split tokio-tungstenite WebSocket streams.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

/// Sending half of a physical connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one encoded frame
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a physical connection
#[async_trait]
pub trait FrameSource: Send {
    /// Receive one encoded frame, `None` once the connection is closed
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

#[async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl<S> FrameSource for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("WebSocket keepalive");
                }
                Ok(_) => {
                    return Err(TransportError::WebSocketError(
                        "unexpected non-binary message".to_string(),
                    ))
                }
                Err(e) => return Err(TransportError::WebSocketError(e.to_string())),
            }
        }
        Ok(None)
    }
}
