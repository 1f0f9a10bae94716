//! Relay gateway
//!
//! One public HTTP listener serves two kinds of traffic:
//!
//! - plain requests, routed by host and path to a mapping and reverse
//!   proxied to its backend
//! - tunnel upgrades at `/_relay/connect`, each carrying one resumable
//!   byte stream to a TCP backend on the allow-list
//!
//! Private mappings are authenticated on every request. Metrics go to a
//! caller-provided prometheus registry and are served on a separate
//! listener.

pub mod config;
pub mod gateway;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;
pub mod websocket;

pub use config::{ConfigError, GatewayConfig};
pub use gateway::{Gateway, GatewayError, Resolution};
pub use metrics::{GatewayMetrics, MetricsError, MetricsRegistry};
pub use policy::TunnelPolicy;
pub use registry::SessionRegistry;
pub use server::{GatewayServer, RunningGateway};
pub use session::{Session, SessionError, SessionSettings};
