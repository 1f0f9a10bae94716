//! Request authentication for private gateway mappings
//!
//! The gateway depends only on the [`Authenticator`] trait: given the parts
//! of a request it returns either the caller's [`Identity`] or a denial.
//! Public mappings never consult it; private mappings consult it on every
//! request.
//!
//! # Provided Authenticators
//!
//! - **Allow**: accepts every request under a fixed identity
//! - **Deny**: rejects requests whose `//host/path` starts with a blocked prefix
//! - **Basic**: HTTP Basic Authentication (RFC 7617)
//! - **Bearer**: Authorization header with Bearer token (RFC 6750)
//!
//! # Usage
//!
//! ```ignore
//! use relaygate_http_auth::{AuthConfig, AuthRequest, AuthResult, HttpAuthenticator};
//!
//! let authenticator = HttpAuthenticator::from_config(&AuthConfig::Bearer {
//!     tokens: vec!["secret".to_string()],
//! });
//! let request = AuthRequest::new("GET", "test.lan", "/")
//!     .with_header("Authorization", "Bearer secret");
//!
//! match authenticator.authenticate(&request) {
//!     AuthResult::Authenticated(identity) => { /* proceed */ }
//!     AuthResult::Unauthorized(reason) => { /* return 401 */ }
//! }
//! ```

mod allow;
mod basic;
mod bearer;

pub use allow::{AllowAuthenticator, DenyAuthenticator};
pub use basic::BasicAuthenticator;
pub use bearer::BearerAuthenticator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Who a request was authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default)]
    pub organization: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.organization {
            Some(organization) => write!(f, "{}@{}", self.username, organization),
            None => write!(f, "{}", self.username),
        }
    }
}

/// Authentication result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Request is authenticated
    Authenticated(Identity),
    /// Request is denied, with a reason suitable for logging
    Unauthorized(String),
}

impl AuthResult {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthResult::Authenticated(_))
    }
}

/// The parts of an HTTP request an authenticator may look at
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl AuthRequest {
    pub fn new(method: &str, host: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First header with the given name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Scheme-relative URL of the request, e.g. `//test.lan/oppose`
    pub fn url(&self) -> String {
        format!("//{}{}", self.host, self.path)
    }
}

/// Capability to authenticate requests
///
/// Implementations must be stateless across calls: each call to
/// `authenticate` is independent.
pub trait Authenticator: Send + Sync {
    /// Authenticate the request
    fn authenticate(&self, request: &AuthRequest) -> AuthResult;

    /// Value for the `WWW-Authenticate` header of a 401 response
    fn challenge(&self) -> Option<String> {
        None
    }

    /// Return the authentication type name (for logging)
    fn auth_type(&self) -> &'static str;
}

/// Authenticator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Allow {
        #[serde(default = "default_username")]
        username: String,
    },
    Deny {
        #[serde(default = "default_username")]
        username: String,
        prefixes: Vec<String>,
    },
    Basic {
        /// "username:password" pairs
        credentials: Vec<String>,
        #[serde(default)]
        realm: Option<String>,
    },
    Bearer {
        tokens: Vec<String>,
    },
}

fn default_username() -> String {
    "anonymous".to_string()
}

/// Shared handle to an authenticator
#[derive(Clone)]
pub struct HttpAuthenticator {
    provider: Arc<dyn Authenticator>,
}

impl HttpAuthenticator {
    /// Create a new authenticator from the given configuration
    pub fn from_config(config: &AuthConfig) -> Self {
        let provider: Arc<dyn Authenticator> = match config {
            AuthConfig::Allow { username } => {
                Arc::new(AllowAuthenticator::new(Identity::new(username.clone())))
            }
            AuthConfig::Deny { username, prefixes } => Arc::new(DenyAuthenticator::new(
                Identity::new(username.clone()),
                prefixes.clone(),
            )),
            AuthConfig::Basic { credentials, realm } => match realm {
                Some(realm) => Arc::new(BasicAuthenticator::with_realm(
                    credentials.clone(),
                    realm.clone(),
                )),
                None => Arc::new(BasicAuthenticator::new(credentials.clone())),
            },
            AuthConfig::Bearer { tokens } => Arc::new(BearerAuthenticator::new(tokens.clone())),
        };

        Self { provider }
    }

    /// Create a new authenticator with a custom provider
    pub fn with_provider(provider: Arc<dyn Authenticator>) -> Self {
        Self { provider }
    }

    pub fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        self.provider.authenticate(request)
    }

    pub fn challenge(&self) -> Option<String> {
        self.provider.challenge()
    }

    pub fn auth_type(&self) -> &'static str {
        self.provider.auth_type()
    }
}

impl fmt::Debug for HttpAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAuthenticator")
            .field("auth_type", &self.auth_type())
            .finish()
    }
}

/// Strip a case-insensitive authorization scheme from a header value
pub(crate) fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let value = value.trim_start();
    let head = value.get(..scheme.len())?;
    let rest = value.get(scheme.len()..)?;
    if !head.eq_ignore_ascii_case(scheme) || !rest.starts_with(' ') {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
