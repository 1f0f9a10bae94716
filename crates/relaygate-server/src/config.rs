//! Gateway configuration
//!
//! Loaded from YAML and validated once, before anything binds a socket.

use crate::policy::TunnelPolicy;
use crate::proxy::Target;
use relaygate_http_auth::AuthConfig;
use relaygate_proto::{duration_millis, MAX_PAYLOAD};
use relaygate_router::{HttpRouter, Mapping, RouteRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config has no mappings defined")]
    NoMappings,

    #[error("error in mapping entry {index}: {message}")]
    Mapping { index: usize, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address of the public HTTP listener
    pub listen: String,
    /// Address of the `/metrics` listener, disabled when unset
    pub metrics_listen: Option<String>,
    pub mappings: Vec<Mapping>,
    /// Allowed tunnel targets; empty disables tunnels
    pub tunnels: Vec<String>,
    /// Authenticator for private mappings
    pub auth: Option<AuthConfig>,
    /// Size of one pool buffer, also the largest data frame payload
    pub buffer_size: usize,
    /// Number of pool buffers shared by all sessions
    pub pool_capacity: usize,
    /// Buffers a session retains for replay before backend reads stall
    pub replay_window: usize,
    /// Bytes a session accepts from its client beyond what the backend took
    pub receive_window: u64,
    #[serde(with = "duration_millis")]
    pub keepalive_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_listen: None,
            mappings: Vec::new(),
            tunnels: Vec::new(),
            auth: None,
            buffer_size: 8192,
            pool_capacity: 1024,
            replay_window: 256,
            receive_window: 1024 * 1024,
            keepalive_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Validate the configuration
    ///
    /// `has_authenticator` tells whether private mappings can be served.
    /// Returns the warnings of an otherwise usable configuration.
    pub fn validate(&self, has_authenticator: bool) -> Result<Vec<String>, ConfigError> {
        if self.mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        let router = HttpRouter::new(Arc::new(RouteRegistry::new()));
        for (index, mapping) in self.mappings.iter().enumerate() {
            if !mapping.from.path.starts_with('/') {
                return Err(ConfigError::Mapping {
                    index,
                    message: format!("path {:?} must start with '/'", mapping.from.path),
                });
            }
            if !mapping.is_public() && !has_authenticator {
                return Err(ConfigError::Mapping {
                    index,
                    message: format!(
                        "{} is private but no authenticator is configured",
                        mapping.from
                    ),
                });
            }
            if let Some(to) = &mapping.to {
                Target::parse(to).map_err(|e| ConfigError::Mapping {
                    index,
                    message: e.to_string(),
                })?;
            }
            router
                .register_mapping(mapping.clone())
                .map_err(|e| ConfigError::Mapping {
                    index,
                    message: e.to_string(),
                })?;
        }

        if self.buffer_size == 0 || self.buffer_size > MAX_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be between 1 and {}",
                MAX_PAYLOAD
            )));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be positive".into()));
        }
        if self.replay_window == 0 {
            return Err(ConfigError::Invalid("replay_window must be positive".into()));
        }
        if self.replay_window > self.pool_capacity {
            return Err(ConfigError::Invalid(
                "replay_window cannot exceed pool_capacity".into(),
            ));
        }
        if self.receive_window == 0 {
            return Err(ConfigError::Invalid("receive_window must be positive".into()));
        }
        TunnelPolicy::parse(&self.tunnels).map_err(ConfigError::Invalid)?;

        let mut warnings = Vec::new();
        if self.tunnels.is_empty() {
            warnings.push("no tunnels configured, tunnel endpoint is disabled".to_string());
        }
        if !has_authenticator {
            warnings.push("no authenticator configured, only public mappings are served".to_string());
        }
        if self.metrics_listen.is_none() {
            warnings.push("no metrics listener configured".to_string());
        }
        for mapping in &self.mappings {
            if mapping.to.is_none() && self.tunnels.is_empty() {
                warnings.push(format!("{} has no target and can never be served", mapping.from));
            }
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
listen: 127.0.0.1:0
tunnels: ["*"]
keepalive_timeout: 250
mappings:
  - from: { host: test1.lan, path: /glad }
    to: http://127.0.0.1:9000
    auth: public
  - from: { host: test2.lan, path: / }
"#;

    #[test]
    fn test_parse_yaml() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.mappings.len(), 2);
        assert!(config.mappings[0].is_public());
        assert!(!config.mappings[1].is_public());
        assert_eq!(config.keepalive_timeout, Duration::from_millis(250));
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.tunnels, vec!["*".to_string()]);
    }

    #[test]
    fn test_no_mappings() {
        let config = GatewayConfig::default();
        let err = config.validate(true).unwrap_err();
        assert_eq!(err.to_string(), "config has no mappings defined");
    }

    #[test]
    fn test_private_mapping_needs_authenticator() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let err = config.validate(false).unwrap_err();
        assert!(err.to_string().starts_with("error in mapping entry 1: "));

        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_duplicate_mapping() {
        let mut config = GatewayConfig::from_yaml(CONFIG).unwrap();
        config.mappings.push(config.mappings[0].clone());
        let err = config.validate(true).unwrap_err();
        assert!(err.to_string().starts_with("error in mapping entry 2: "));
    }

    #[test]
    fn test_bad_path() {
        let config = GatewayConfig::from_yaml(
            "mappings:\n  - from: { host: a, path: glad }\n    auth: public\n",
        )
        .unwrap();
        assert!(matches!(
            config.validate(false),
            Err(ConfigError::Mapping { index: 0, .. })
        ));
    }

    #[test]
    fn test_tls_backend_is_rejected() {
        let config = GatewayConfig::from_yaml(
            "mappings:\n  - from: { host: a, path: / }\n    to: https://backend\n    auth: public\n",
        )
        .unwrap();
        let err = config.validate(false).unwrap_err();
        assert!(err.to_string().starts_with("error in mapping entry 0: "));
    }

    #[test]
    fn test_zero_sizes() {
        let mut config = GatewayConfig::from_yaml(CONFIG).unwrap();
        config.buffer_size = 0;
        assert!(matches!(config.validate(true), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::from_yaml(CONFIG).unwrap();
        config.replay_window = 0;
        assert!(matches!(config.validate(true), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_warnings() {
        let config = GatewayConfig::from_yaml(
            "mappings:\n  - from: { host: a, path: / }\n    to: http://127.0.0.1:1\n    auth: public\n",
        )
        .unwrap();
        let warnings = config.validate(false).unwrap();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("tunnel"));
    }
}
