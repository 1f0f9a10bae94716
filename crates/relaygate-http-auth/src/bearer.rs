//! Bearer Token Authentication provider (RFC 6750)
//!
//! ```text
//! Authorization: Bearer <token>
//! ```

use crate::{strip_scheme, AuthRequest, AuthResult, Authenticator, Identity};
use std::collections::HashSet;
use tracing::debug;

/// Bearer Token Authentication provider
///
/// Validates tokens against a list of allowed tokens. Tokens carry no user
/// name, so callers are identified as `bearer`.
pub struct BearerAuthenticator {
    valid_tokens: HashSet<String>,
}

impl BearerAuthenticator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            valid_tokens: tokens.into_iter().collect(),
        }
    }
}

impl Authenticator for BearerAuthenticator {
    fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        match request
            .header("authorization")
            .and_then(|value| strip_scheme(value, "bearer"))
        {
            Some(token) if self.valid_tokens.contains(token) => {
                debug!("Bearer auth: valid token");
                AuthResult::Authenticated(Identity::new("bearer"))
            }
            Some(_) => {
                debug!("Bearer auth: invalid token");
                AuthResult::Unauthorized("invalid token".to_string())
            }
            None => {
                debug!("Bearer auth: no bearer token");
                AuthResult::Unauthorized("missing token".to_string())
            }
        }
    }

    fn challenge(&self) -> Option<String> {
        Some("Bearer".to_string())
    }

    fn auth_type(&self) -> &'static str {
        "bearer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token() {
        let provider = BearerAuthenticator::new(vec!["secret-token-123".to_string()]);
        let request = AuthRequest::new("GET", "a", "/")
            .with_header("Authorization", "Bearer secret-token-123");

        assert_eq!(
            provider.authenticate(&request),
            AuthResult::Authenticated(Identity::new("bearer"))
        );
    }

    #[test]
    fn test_invalid_token() {
        let provider = BearerAuthenticator::new(vec!["secret-token-123".to_string()]);
        let request =
            AuthRequest::new("GET", "a", "/").with_header("Authorization", "Bearer nope");

        assert_eq!(
            provider.authenticate(&request),
            AuthResult::Unauthorized("invalid token".to_string())
        );
    }

    #[test]
    fn test_missing_token() {
        let provider = BearerAuthenticator::new(vec!["secret-token-123".to_string()]);
        let request = AuthRequest::new("GET", "a", "/");

        assert_eq!(
            provider.authenticate(&request),
            AuthResult::Unauthorized("missing token".to_string())
        );
    }
}
