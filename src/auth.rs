//! Identity validation at the socket boundary.
//!
//! The delivery plane never issues credentials. It consumes bearer tokens
//! minted elsewhere and turns them into [`Claims`] through a pluggable
//! [`TokenVerifier`]. Claims are resolved to a local user row by the user
//! repository (`get_or_create_from_claims`).

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Verified identity claims extracted from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Stable subject identifier from the identity provider.
    pub subject: String,
    /// Email address, used as the bridging key when a subject id is not
    /// yet attached to a local user.
    pub email: String,
    /// Display name preferred by the identity provider.
    pub preferred_name: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Validates bearer tokens into identity claims.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Token verifier backed by a fixed token table.
///
/// Suited to development deployments and tests; production deployments
/// plug in a verifier for their identity provider instead.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, claims: Claims) {
        self.tokens.insert(token.into(), claims);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}
