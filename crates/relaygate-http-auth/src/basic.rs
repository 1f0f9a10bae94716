//! HTTP Basic Authentication provider (RFC 7617)
//!
//! Credentials are transmitted as `username:password` encoded in base64 in
//! the Authorization header:
//!
//! ```text
//! Authorization: Basic <base64(username:password)>
//! ```
//!
//! Basic authentication should only be used behind TLS, as credentials are
//! transmitted in an easily reversible encoding.

use crate::{strip_scheme, AuthRequest, AuthResult, Authenticator, Identity};
use base64::Engine;
use std::collections::HashSet;
use tracing::debug;

/// HTTP Basic Authentication provider
///
/// Validates credentials against a list of allowed `username:password` pairs
/// and authenticates the caller as `username`.
pub struct BasicAuthenticator {
    /// Set of valid credentials in "username:password" format
    valid_credentials: HashSet<String>,
    /// Realm for the WWW-Authenticate header
    realm: String,
}

impl BasicAuthenticator {
    pub fn new(credentials: Vec<String>) -> Self {
        Self::with_realm(credentials, "relaygate".to_string())
    }

    pub fn with_realm(credentials: Vec<String>, realm: String) -> Self {
        Self {
            valid_credentials: credentials.into_iter().collect(),
            realm,
        }
    }

    /// Extract and decode credentials from Authorization header
    fn extract_credentials(auth_header: &str) -> Option<String> {
        let encoded = strip_scheme(auth_header, "basic")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        String::from_utf8(decoded).ok()
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        let Some(header) = request.header("authorization") else {
            debug!("Basic auth: no Authorization header");
            return AuthResult::Unauthorized("missing credentials".to_string());
        };

        let Some(credentials) = Self::extract_credentials(header) else {
            debug!("Basic auth: could not decode credentials");
            return AuthResult::Unauthorized("malformed credentials".to_string());
        };

        if !self.valid_credentials.contains(&credentials) {
            debug!("Basic auth: invalid credentials");
            return AuthResult::Unauthorized("invalid credentials".to_string());
        }

        let username = credentials
            .split_once(':')
            .map(|(user, _)| user)
            .unwrap_or(credentials.as_str());
        debug!("Basic auth: valid credentials for {}", username);
        AuthResult::Authenticated(Identity::new(username))
    }

    fn challenge(&self) -> Option<String> {
        Some(format!(
            "Basic realm=\"{}\"",
            self.realm.replace('"', "\\\"")
        ))
    }

    fn auth_type(&self) -> &'static str {
        "basic"
    }
}
