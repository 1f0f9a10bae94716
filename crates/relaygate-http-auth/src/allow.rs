//! Fixed-verdict authenticators, mostly useful for tests and open deployments

use crate::{AuthRequest, AuthResult, Authenticator, Identity};
use tracing::debug;

/// Accepts every request under a fixed identity
pub struct AllowAuthenticator {
    identity: Identity,
}

impl AllowAuthenticator {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

impl Authenticator for AllowAuthenticator {
    fn authenticate(&self, _request: &AuthRequest) -> AuthResult {
        AuthResult::Authenticated(self.identity.clone())
    }

    fn auth_type(&self) -> &'static str {
        "allow"
    }
}

/// Rejects requests whose `//host/path` starts with any blocked prefix,
/// accepts everything else under a fixed identity
pub struct DenyAuthenticator {
    identity: Identity,
    blocked: Vec<String>,
}

impl DenyAuthenticator {
    pub fn new(identity: Identity, blocked: Vec<String>) -> Self {
        Self { identity, blocked }
    }
}

impl Authenticator for DenyAuthenticator {
    fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        let url = request.url();
        if let Some(prefix) = self.blocked.iter().find(|p| url.starts_with(p.as_str())) {
            debug!("Deny auth: {} blocked by {}", url, prefix);
            return AuthResult::Unauthorized(format!("{} is blocked", url));
        }
        AuthResult::Authenticated(self.identity.clone())
    }

    fn auth_type(&self) -> &'static str {
        "deny"
    }
}
