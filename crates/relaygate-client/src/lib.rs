//! Tunnel client library - Public API
//!
//! ```ignore
//! let pool = BufferPool::new(8192, 1024);
//! let tunnel = Tunnel::open(pool, "127.0.0.1", 22, TunnelOptions::default())?;
//!
//! let supervisor = tokio::spawn({
//!     let tunnel = tunnel.clone();
//!     async move { tunnel.keep_connected(&relay_url).await }
//! });
//! tokio::try_join!(tunnel.send(tokio::io::stdin()), tunnel.receive(tokio::io::stdout()))?;
//! ```

pub mod config;
pub mod error;
pub mod tunnel;

pub use config::TunnelOptions;
pub use error::TunnelError;
pub use tunnel::{relay_endpoint, Tunnel, TunnelState, TunnelStats};

pub use relaygate_connection::{BufferPool, ReconnectConfig};
