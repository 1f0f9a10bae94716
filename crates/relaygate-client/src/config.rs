//! Client configuration

use relaygate_connection::ReconnectConfig;
use relaygate_proto::duration_millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelOptions {
    /// `Authorization` header presented on every upgrade request
    pub authorization: Option<String>,
    /// Overrides the `Host` header of upgrade requests
    pub host_header: Option<String>,
    /// How long to wait for the relay to answer the handshake
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    /// Bytes received from the relay but not yet written by `receive`
    pub receive_window: u64,
    /// Pool buffers retained for replay before `send` blocks
    pub replay_window: usize,
    #[serde(skip)]
    pub reconnect: ReconnectConfig,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            authorization: None,
            host_header: None,
            handshake_timeout: Duration::from_secs(10),
            receive_window: 1024 * 1024,
            replay_window: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TunnelOptions {
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn with_bearer_token(self, token: &str) -> Self {
        self.with_authorization(format!("Bearer {}", token))
    }

    pub fn with_host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_yaml() {
        let options: TunnelOptions =
            serde_yaml::from_str("authorization: Bearer abc\nhandshake_timeout: 1500\n").unwrap();
        assert_eq!(options.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(options.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(options.receive_window, 1024 * 1024);
    }

    #[test]
    fn test_builders() {
        let options = TunnelOptions::default()
            .with_bearer_token("t")
            .with_host_header("test2.lan");
        assert_eq!(options.authorization.as_deref(), Some("Bearer t"));
        assert_eq!(options.host_header.as_deref(), Some("test2.lan"));
    }
}
