//! Tunnel errors

use relaygate_connection::{RelayError, SequenceError, TransportError};
use relaygate_proto::RejectCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid tunnel target: {0}")]
    InvalidTarget(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Relay refused the upgrade with HTTP {0}")]
    HttpStatus(u16),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Relay rejected the tunnel ({code}): {reason}")]
    Rejected { code: RejectCode, reason: String },

    #[error("Protocol desync: {0}")]
    Desync(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Relay error: {0}")]
    Relay(RelayError),

    #[error("Max reconnection attempts reached")]
    RetriesExhausted,

    #[error("Tunnel closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TunnelError {
    /// Transport failures are retried by the supervisor, everything else ends
    /// the tunnel.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::ConnectionFailed(_) | TunnelError::HandshakeTimeout => true,
            TunnelError::HttpStatus(status) => !matches!(status, 401 | 403 | 404),
            TunnelError::Relay(RelayError::Transport(_)) => true,
            _ => false,
        }
    }
}

impl From<RelayError> for TunnelError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Rejected { code, reason } => TunnelError::Rejected { code, reason },
            RelayError::Sequence(SequenceError::Desync(msg)) => TunnelError::Desync(msg),
            RelayError::Sequence(SequenceError::Closed) => TunnelError::Closed,
            other => TunnelError::Relay(other),
        }
    }
}

impl From<SequenceError> for TunnelError {
    fn from(err: SequenceError) -> Self {
        RelayError::Sequence(err).into()
    }
}

impl From<tungstenite::Error> for TunnelError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => TunnelError::HttpStatus(response.status().as_u16()),
            tungstenite::Error::Url(e) => TunnelError::InvalidUrl(e.to_string()),
            other => TunnelError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        TunnelError::Relay(RelayError::Transport(err))
    }
}
