//! Mapping entries as they appear in the gateway configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host and path a mapping is reachable under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPath {
    /// Empty matches any host without a more specific mapping
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

impl HostPath {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}{}", self.host, self.path)
    }
}

/// Whether requests through a mapping must be authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingAuth {
    #[default]
    Private,
    Public,
}

/// A host/path to backend routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub from: HostPath,
    /// Backend URL or `host:port`; `None` exposes only the tunnel endpoint
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub auth: MappingAuth,
}

impl Mapping {
    pub fn new(host: &str, path: &str, to: Option<&str>, auth: MappingAuth) -> Self {
        Self {
            from: HostPath::new(host, path),
            to: to.map(str::to_string),
            auth,
        }
    }

    pub fn is_public(&self) -> bool {
        self.auth == MappingAuth::Public
    }
}
