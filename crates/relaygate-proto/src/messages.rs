//! Control messages exchanged in `Control` frames

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handshake and teardown messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// First physical connection of a tunnel (client -> gateway)
    ///
    /// `window` is the sender's receive window in bytes: the peer never has
    /// more than that in flight beyond the last acknowledgment.
    Open { host: String, port: u16, window: u64 },
    /// Reconnect of an existing tunnel (client -> gateway)
    ///
    /// `ack` is what the client delivered from the gateway's stream, `pos` is
    /// the total number of bytes the client has written to its own stream.
    Resume {
        session_id: String,
        ack: u64,
        pos: u64,
        window: u64,
    },
    /// Handshake accepted (gateway -> client), same semantics as `Resume`
    Ready {
        session_id: String,
        ack: u64,
        pos: u64,
        window: u64,
    },
    /// Terminal failure for the session, sent by either side
    Reject { code: RejectCode, reason: String },
}

/// Why a session cannot continue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RejectCode {
    /// The backend target could not be dialed
    BackendUnreachable,
    /// The session token is not (or no longer) known
    UnknownSession,
    /// Resume offsets cannot be satisfied
    Desync,
    /// The requested target is not on the tunnel allow-list
    Forbidden,
    /// Unexpected or undecodable handshake
    Malformed,
    /// The session was torn down (backend gone, keepalive expired)
    SessionClosed,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::BackendUnreachable => "backend_unreachable",
            RejectCode::UnknownSession => "unknown_session",
            RejectCode::Desync => "desync",
            RejectCode::Forbidden => "forbidden",
            RejectCode::Malformed => "malformed",
            RejectCode::SessionClosed => "session_closed",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ControlMessage::Resume {
            session_id: "abc".to_string(),
            ack: 1024,
            pos: 2048,
            window: 1 << 20,
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();

        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_reject_code_labels() {
        assert_eq!(RejectCode::BackendUnreachable.to_string(), "backend_unreachable");
        assert_eq!(RejectCode::Desync.as_str(), "desync");
    }
}
