//! Reliable byte streams over replaceable physical connections
//!
//! The pieces shared by the tunnel client and the gateway sessions:
//!
//! - [`BufferPool`]: bounded pool of fixed-size buffers, the only backpressure
//!   mechanism of the relay
//! - [`Outbound`] / [`Inbound`]: per-direction sequence tracking, replay
//!   buffer and resume arithmetic
//! - [`Relay`]: pumps one physical connection until it breaks, completes or is
//!   cancelled
//! - [`ReconnectManager`]: exponential backoff with jitter between attempts

pub mod pool;
pub mod reconnect;
pub mod relay;
pub mod sequence;
pub mod transport;

pub use pool::{Buffer, BufferPool, PoolStats};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use relay::{LinkExit, Relay, RelayError};
pub use sequence::{Inbound, Outbound, Pending, SequenceError};
pub use transport::{FrameSink, FrameSource, TransportError};
