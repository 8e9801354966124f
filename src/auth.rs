//! Token validation seam for auth-required tools.
//!
//! The framework never issues or parses OAuth tokens itself; it hands the
//! opaque bearer token to a host-provided [`TokenValidator`] and consumes the
//! claims it returns.

use async_trait::async_trait;

/// Claims extracted from a validated access token.
#[derive(Debug, Clone, Default)]
pub struct TokenClaims {
    pub user_id: Option<String>,
    /// Provider token injected into auth-required tool arguments as
    /// `_external_access_token`.
    pub external_access_token: Option<String>,
    pub scopes: Vec<String>,
}

impl TokenClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("token validation unavailable: {0}")]
    Unavailable(String),
}

/// Validates bearer tokens for auth-required tools.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

/// Per-handler auth requirement recorded at registration.
#[derive(Debug, Clone, Default)]
pub struct AuthRequirement {
    pub required: bool,
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_lookup() {
        let claims = TokenClaims {
            user_id: Some("u1".into()),
            external_access_token: None,
            scopes: vec!["read".into(), "write".into()],
        };
        assert!(claims.has_scope("read"));
        assert!(!claims.has_scope("admin"));
    }
}
