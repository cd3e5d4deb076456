//! Bearer token sources for the VM API.

pub mod credentials;
pub mod eks;
pub mod sigv4;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token provider misconfigured: {0}")]
    Config(String),
    #[error("Could not resolve AWS credentials: {0}")]
    Credentials(String),
    #[error("Could not sign token request: {0}")]
    Signing(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token usable as `Authorization: Bearer <token>`.
    async fn get_token(&self) -> Result<String, TokenError>;

    /// Reports whether the provider is configured sanely. Does not contact anything.
    fn is_valid(&self) -> bool;

    /// Drops any cached token so the next [`get_token`](Self::get_token) refreshes.
    fn invalidate_token(&self);
}

/// A fixed token configured by the user.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String, TokenError> {
        if self.token.is_empty() {
            return Err(TokenError::Config("static token is empty".to_string()));
        }
        Ok(self.token.clone())
    }

    fn is_valid(&self) -> bool {
        !self.token.is_empty()
    }

    fn invalidate_token(&self) {}
}
