//! Relay protocol definitions
//!
//! Wire format shared by the tunnel client and the gateway: every WebSocket
//! binary message carries exactly one [`Frame`]. Control frames carry a
//! bincode-encoded [`ControlMessage`] used for the open/resume handshake.

pub mod duration_millis;
pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError, FrameFlags, FrameType};
pub use messages::{ControlMessage, RejectCode};

/// Maximum payload carried by a single frame (1MB)
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Path of the tunnel endpoint under every mapped host
pub const RELAY_PATH: &str = "/_relay/connect";
