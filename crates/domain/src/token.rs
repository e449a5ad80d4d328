use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::time::sleep;

use crate::channel::{Channel, CredentialState, CredentialUpdate};
use crate::clock::Clock;
use crate::error::DomainError;
use crate::lock::{DistributedLock, LockGuard, TOKEN_LOCK_KIND, lock_key};
use crate::ports::channel::ChannelRepository;
use crate::ports::coordination::{CoordinationError, CoordinationStore};
use crate::ports::provider::{ProviderError, ProviderTokens, TokenProvider};

const TOKEN_REFRESH_TOTAL: &str = "chanlink_token_refresh_total";
const TOKEN_LOCK_CONTENTION_TOTAL: &str = "chanlink_token_lock_contention_total";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("channel not found")]
    NotFound,
    #[error("channel credentials unrecoverable, re-authorization required: {0}")]
    Unrecoverable(String),
    #[error("access token temporarily unavailable, retry later")]
    TemporarilyUnavailable,
    #[error("provider transient error: {0}")]
    ProviderTransient(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authorization state is unknown or expired")]
    InvalidState,
    #[error("store error: {0}")]
    Store(String),
    #[error("token lifecycle configuration error: {0}")]
    Configuration(String),
}

impl TokenError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TemporarilyUnavailable | Self::ProviderTransient(_) | Self::Store(_)
        )
    }

    fn from_store(err: CoordinationError) -> Self {
        Self::Store(err.to_string())
    }

    pub(crate) fn from_domain(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::NotFound,
            DomainError::Validation(message) => Self::Validation(message),
            other => Self::Store(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TokenLifecycleConfig {
    /// Must outlast the worst-case provider round trip.
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Slack subtracted from the acquisition time when deciding whether an
    /// observed record was refreshed by the lock holder.
    pub poll_safety_margin: Duration,
    /// Subtracted from the provider-issued TTL when computing `expire_at`.
    pub expiry_safety_margin: Duration,
    pub refresh_retry_attempts: u32,
    pub refresh_retry_backoff: Duration,
    /// Hard timeout applied by the provider client.
    pub provider_timeout: Duration,
}

impl Default for TokenLifecycleConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            poll_attempts: 30,
            poll_safety_margin: Duration::from_secs(2),
            expiry_safety_margin: Duration::from_secs(300),
            refresh_retry_attempts: 2,
            refresh_retry_backoff: Duration::from_millis(500),
            provider_timeout: Duration::from_secs(5),
        }
    }
}

impl TokenLifecycleConfig {
    pub fn validate(&self) -> Result<(), TokenError> {
        if self.lock_ttl.is_zero() || self.poll_interval.is_zero() || self.poll_attempts == 0 {
            return Err(TokenError::Configuration(
                "lock ttl, poll interval and poll attempts must be non-zero".into(),
            ));
        }
        if self.poll_interval * self.poll_attempts <= self.lock_ttl {
            return Err(TokenError::Configuration(format!(
                "poll window {}ms must exceed lock ttl {}ms",
                (self.poll_interval * self.poll_attempts).as_millis(),
                self.lock_ttl.as_millis()
            )));
        }
        if self.provider_timeout.is_zero() || self.provider_timeout >= self.lock_ttl {
            return Err(TokenError::Configuration(format!(
                "provider timeout {}ms must be non-zero and below lock ttl {}ms",
                self.provider_timeout.as_millis(),
                self.lock_ttl.as_millis()
            )));
        }
        Ok(())
    }
}

/// `now + expires_in - margin`, never earlier than `now`.
pub fn expire_at_ms(now_ms: i64, expires_in_secs: u64, safety_margin: Duration) -> i64 {
    let ttl_ms = expires_in_secs.saturating_mul(1_000) as i64;
    let margin_ms = safety_margin.as_millis() as i64;
    now_ms + ttl_ms.saturating_sub(margin_ms).max(0)
}

pub(crate) fn credential_update(
    tokens: ProviderTokens,
    now_ms: i64,
    safety_margin: Duration,
) -> CredentialUpdate {
    CredentialUpdate {
        expire_at_ms: expire_at_ms(now_ms, tokens.expires_in_secs, safety_margin),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    }
}

/// Keeps one valid access token per channel across every service instance.
/// Refreshes are serialized by a distributed lock; instances that lose the
/// race poll the channel record until the winner has persisted its result.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    channels: Arc<dyn ChannelRepository>,
    provider: Arc<dyn TokenProvider>,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
    config: TokenLifecycleConfig,
}

impl TokenLifecycleManager {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        provider: Arc<dyn TokenProvider>,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: TokenLifecycleConfig,
    ) -> Result<Self, TokenError> {
        config.validate()?;
        Ok(Self {
            channels,
            provider,
            lock: DistributedLock::new(store),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &TokenLifecycleConfig {
        &self.config
    }

    pub async fn get_valid_access_token(
        &self,
        channel_id: &str,
    ) -> Result<SecretString, TokenError> {
        let channel = self.load(channel_id).await?;
        if !channel.has_refresh_token() {
            return Err(TokenError::Unrecoverable(format!(
                "channel {channel_id} has no refresh token"
            )));
        }
        if let Some(token) = channel.valid_access_token(self.clock.now_ms()) {
            return Ok(token.clone());
        }

        let key = lock_key(TOKEN_LOCK_KIND, channel_id);
        let attempt_started_ms = self.clock.now_ms();
        if let Some(guard) = self.try_lock(&key).await? {
            return self.refresh_holding(guard, channel_id).await;
        }

        counter!(TOKEN_LOCK_CONTENTION_TOTAL).increment(1);
        tracing::debug!(channel_id, "token refresh in progress elsewhere, polling");
        if let Some(token) = self.poll_for_refresh(channel_id, attempt_started_ms).await? {
            return Ok(token);
        }

        // The holder may have died without releasing; by now its TTL is over.
        match self.try_lock(&key).await? {
            Some(guard) => self.refresh_holding(guard, channel_id).await,
            None => {
                tracing::warn!(channel_id, "token refresh lock still contended after polling");
                Err(TokenError::TemporarilyUnavailable)
            }
        }
    }

    pub async fn credential_state(&self, channel_id: &str) -> Result<CredentialState, TokenError> {
        let channel = self.load(channel_id).await?;
        let refreshing = self
            .lock
            .is_held(&lock_key(TOKEN_LOCK_KIND, channel_id))
            .await
            .map_err(TokenError::from_store)?;
        Ok(channel.credential_state(self.clock.now_ms(), refreshing))
    }

    async fn load(&self, channel_id: &str) -> Result<Channel, TokenError> {
        self.channels
            .get(channel_id)
            .await
            .map_err(TokenError::from_domain)?
            .ok_or(TokenError::NotFound)
    }

    async fn try_lock(&self, key: &str) -> Result<Option<LockGuard>, TokenError> {
        self.lock
            .acquire(key, self.config.lock_ttl)
            .await
            .map_err(TokenError::from_store)
    }

    /// Runs the refresh on its own task so that a provider-rotated refresh
    /// token is always persisted and the lock released, even when the caller
    /// is dropped mid-flight.
    async fn refresh_holding(
        &self,
        guard: LockGuard,
        channel_id: &str,
    ) -> Result<SecretString, TokenError> {
        let manager = self.clone();
        let owned_id = channel_id.to_string();
        let task = tokio::spawn(async move {
            let result = manager.refresh_locked(&owned_id).await;
            guard.release_logged().await;
            result
        });
        task.await.map_err(|err| {
            tracing::error!(channel_id, error = %err, "token refresh task failed");
            TokenError::TemporarilyUnavailable
        })?
    }

    async fn refresh_locked(&self, channel_id: &str) -> Result<SecretString, TokenError> {
        // A peer may have finished refreshing between our read and our acquire.
        let channel = self.load(channel_id).await?;
        if let Some(token) = channel.valid_access_token(self.clock.now_ms()) {
            tracing::debug!(channel_id, "token already refreshed by a peer");
            return Ok(token.clone());
        }
        let refresh_token = channel.refresh_token.clone().ok_or_else(|| {
            TokenError::Unrecoverable(format!("channel {channel_id} has no refresh token"))
        })?;

        let tokens = match self.call_refresh(channel_id, &refresh_token).await {
            Ok(tokens) => tokens,
            Err(err) => {
                let result = if matches!(err, TokenError::Unrecoverable(_)) {
                    "rejected"
                } else {
                    "failed"
                };
                counter!(TOKEN_REFRESH_TOTAL, "result" => result).increment(1);
                return Err(err);
            }
        };

        let update = credential_update(
            tokens,
            self.clock.now_ms(),
            self.config.expiry_safety_margin,
        );
        let persisted = self
            .channels
            .update_credentials(channel_id, &update, channel.updated_at_ms)
            .await
            .map_err(TokenError::from_domain)?;
        counter!(TOKEN_REFRESH_TOTAL, "result" => "refreshed").increment(1);

        if persisted.is_some() {
            tracing::info!(
                channel_id,
                expire_at_ms = update.expire_at_ms,
                "channel access token refreshed"
            );
            return Ok(update.access_token);
        }

        // Someone rewrote the record (e.g. a re-authorization) while we were
        // refreshing; prefer their token when it is usable.
        tracing::warn!(channel_id, "conditional credential update lost the race");
        let latest = self.load(channel_id).await?;
        Ok(latest
            .valid_access_token(self.clock.now_ms())
            .cloned()
            .unwrap_or(update.access_token))
    }

    async fn call_refresh(
        &self,
        channel_id: &str,
        refresh_token: &SecretString,
    ) -> Result<ProviderTokens, TokenError> {
        let attempts = self.config.refresh_retry_attempts.saturating_add(1);
        for attempt in 0..attempts {
            match self.provider.refresh(refresh_token.expose_secret()).await {
                Ok(tokens) => return Ok(tokens),
                Err(ProviderError::Rejected { error, description }) => {
                    tracing::warn!(
                        channel_id,
                        provider_error = %error,
                        "provider rejected refresh token"
                    );
                    return Err(TokenError::Unrecoverable(format!("{error}: {description}")));
                }
                Err(ProviderError::InvalidResponse(message)) => {
                    return Err(TokenError::ProviderTransient(message));
                }
                Err(ProviderError::Transient(message)) => {
                    if attempt + 1 < attempts {
                        tracing::debug!(
                            channel_id,
                            attempt = attempt + 1,
                            error = %message,
                            "retrying token refresh"
                        );
                        sleep(self.config.refresh_retry_backoff).await;
                        continue;
                    }
                    return Err(TokenError::ProviderTransient(message));
                }
            }
        }

        Err(TokenError::ProviderTransient(
            "retry loop exited unexpectedly".to_string(),
        ))
    }

    async fn poll_for_refresh(
        &self,
        channel_id: &str,
        attempt_started_ms: i64,
    ) -> Result<Option<SecretString>, TokenError> {
        let threshold_ms =
            attempt_started_ms - self.config.poll_safety_margin.as_millis() as i64;
        for _ in 0..self.config.poll_attempts {
            sleep(self.config.poll_interval).await;
            let channel = self.load(channel_id).await?;
            if channel.updated_at_ms <= threshold_ms {
                continue;
            }
            if let Some(token) = channel.valid_access_token(self.clock.now_ms()) {
                return Ok(Some(token.clone()));
            }
        }
        Ok(None)
    }
}
