use secrecy::SecretString;
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected token request: {error}: {description}")]
    Rejected { error: String, description: String },
    #[error("provider transient error: {0}")]
    Transient(String),
    #[error("provider response decode error: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Clone)]
pub struct ProviderTokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_in_secs: u64,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in_secs", &self.expires_in_secs)
            .finish()
    }
}

/// The provider's token-exchange endpoint.
pub trait TokenProvider: Send + Sync {
    fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>>;

    fn refresh(&self, refresh_token: &str) -> BoxFuture<'_, Result<ProviderTokens, ProviderError>>;
}
