//! Frame transport over upgraded axum WebSockets

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relaygate_connection::{FrameSink, FrameSource, TransportError};
use tracing::trace;

/// Sending half of an upgraded relay connection
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Receiving half of an upgraded relay connection
pub struct WsSource(SplitStream<WebSocket>);

/// Split an upgraded socket into frame sink and source
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, source) = socket.split();
    (WsSink(sink), WsSource(source))
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(&mut self.0)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.0.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("WebSocket keepalive");
                }
                Ok(Message::Text(_)) => {
                    return Err(TransportError::WebSocketError(
                        "unexpected text message".to_string(),
                    ))
                }
                Err(e) => return Err(TransportError::WebSocketError(e.to_string())),
            }
        }
        Ok(None)
    }
}
