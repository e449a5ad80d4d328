use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::channel::{Channel, ChannelConnect};
use crate::clock::Clock;
use crate::ports::channel::ChannelRepository;
use crate::ports::coordination::CoordinationStore;
use crate::ports::provider::{ProviderError, TokenProvider};
use crate::token::{TokenError, credential_update};
use crate::util::random_token;

const PKCE_KEY_PREFIX: &str = "oauth:pkce:";

#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    /// 32 random bytes, base64url-encoded: a 43-character verifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthorizationConfig {
    pub app_id: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub pkce_ttl: Duration,
    pub expiry_safety_margin: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingAuthorization {
    group_id: String,
    code_verifier: String,
}

/// Runs the provider's authorization-code handshake with PKCE and turns the
/// result into a connected channel.
#[derive(Clone)]
pub struct AuthorizationService {
    store: Arc<dyn CoordinationStore>,
    provider: Arc<dyn TokenProvider>,
    channels: Arc<dyn ChannelRepository>,
    clock: Arc<dyn Clock>,
    config: AuthorizationConfig,
}

impl AuthorizationService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        provider: Arc<dyn TokenProvider>,
        channels: Arc<dyn ChannelRepository>,
        clock: Arc<dyn Clock>,
        config: AuthorizationConfig,
    ) -> Self {
        Self {
            store,
            provider,
            channels,
            clock,
            config,
        }
    }

    pub async fn begin_authorization(
        &self,
        group_id: &str,
    ) -> Result<AuthorizationRequest, TokenError> {
        let group_id = group_id.trim();
        if group_id.is_empty() {
            return Err(TokenError::Validation("group_id must not be empty".into()));
        }
        let pkce = PkceChallenge::generate();
        let state = random_token();
        let pending = PendingAuthorization {
            group_id: group_id.to_string(),
            code_verifier: pkce.verifier,
        };
        let payload =
            serde_json::to_string(&pending).map_err(|err| TokenError::Store(err.to_string()))?;
        self.store
            .set(&pending_key(&state), &payload, Some(self.config.pkce_ttl))
            .await
            .map_err(|err| TokenError::Store(err.to_string()))?;

        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("app_id", self.config.app_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|err| TokenError::Configuration(format!("invalid authorize url: {err}")))?;

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Exchanges `code` for tokens. The state is single-use.
    pub async fn complete_authorization(
        &self,
        state: &str,
        code: &str,
        provider_id: &str,
    ) -> Result<Channel, TokenError> {
        let key = pending_key(state);
        let payload = self
            .store
            .get(&key)
            .await
            .map_err(|err| TokenError::Store(err.to_string()))?
            .ok_or(TokenError::InvalidState)?;
        let claimed = self
            .store
            .delete(&key)
            .await
            .map_err(|err| TokenError::Store(err.to_string()))?;
        if !claimed {
            return Err(TokenError::InvalidState);
        }
        let pending: PendingAuthorization =
            serde_json::from_str(&payload).map_err(|err| TokenError::Store(err.to_string()))?;

        let tokens = self
            .provider
            .exchange_code(code, &pending.code_verifier)
            .await
            .map_err(|err| match err {
                ProviderError::Rejected { error, description } => {
                    TokenError::Unrecoverable(format!("{error}: {description}"))
                }
                ProviderError::Transient(message) | ProviderError::InvalidResponse(message) => {
                    TokenError::ProviderTransient(message)
                }
            })?;

        let connect = ChannelConnect {
            group_id: pending.group_id,
            provider_id: provider_id.to_string(),
            credentials: credential_update(
                tokens,
                self.clock.now_ms(),
                self.config.expiry_safety_margin,
            ),
        };
        let channel = self
            .channels
            .upsert_connected(&connect)
            .await
            .map_err(TokenError::from_domain)?;
        tracing::info!(
            channel_id = %channel.id,
            group_id = %channel.group_id,
            "channel connected"
        );
        Ok(channel)
    }
}

fn pending_key(state: &str) -> String {
    format!("{PKCE_KEY_PREFIX}{state}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_rfc7636_example() {
        let pkce =
            PkceChallenge::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".into());
        assert_eq!(pkce.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn generated_verifier_is_url_safe_and_long_enough() {
        let pkce = PkceChallenge::generate();
        assert!((43..=128).contains(&pkce.verifier.len()));
        assert!(
            pkce.verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(pkce.verifier, PkceChallenge::generate().verifier);
    }
}
