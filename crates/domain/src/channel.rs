use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::DomainResult;
use crate::clock::{Clock, SystemClock};
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::channel::ChannelRepository;
use crate::util::uuid_v7_without_dashes;

/// One provider connection owned by a tenant group.
#[derive(Clone)]
pub struct Channel {
    pub id: String,
    pub provider_id: String,
    pub group_id: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expire_at_ms: Option<i64>,
    pub updated_at_ms: i64,
}

impl Channel {
    /// The access token, if present and not yet expired at `now_ms`.
    pub fn valid_access_token(&self, now_ms: i64) -> Option<&SecretString> {
        match (&self.access_token, self.expire_at_ms) {
            (Some(token), Some(expire_at_ms)) if now_ms < expire_at_ms => Some(token),
            _ => None,
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn credential_state(&self, now_ms: i64, refresh_in_progress: bool) -> CredentialState {
        if !self.has_refresh_token() {
            return CredentialState::Unrecoverable;
        }
        if self.valid_access_token(now_ms).is_some() {
            return CredentialState::Valid;
        }
        if refresh_in_progress {
            CredentialState::Refreshing
        } else {
            CredentialState::Expired
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("group_id", &self.group_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expire_at_ms", &self.expire_at_ms)
            .field("updated_at_ms", &self.updated_at_ms)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Valid,
    Expired,
    Refreshing,
    Unrecoverable,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::Refreshing => "refreshing",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

#[derive(Clone)]
pub struct CredentialUpdate {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expire_at_ms: i64,
}

impl std::fmt::Debug for CredentialUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialUpdate")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expire_at_ms", &self.expire_at_ms)
            .finish()
    }
}

/// Result of a completed OAuth handshake for a group.
#[derive(Clone, Debug)]
pub struct ChannelConnect {
    pub group_id: String,
    pub provider_id: String,
    pub credentials: CredentialUpdate,
}

#[derive(Clone)]
pub struct InMemoryChannelRepository {
    store: Arc<RwLock<HashMap<String, Channel>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryChannelRepository {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub async fn insert(&self, channel: Channel) {
        self.store.write().await.insert(channel.id.clone(), channel);
    }
}

impl ChannelRepository for InMemoryChannelRepository {
    fn get(&self, channel_id: &str) -> BoxFuture<'_, DomainResult<Option<Channel>>> {
        let channel_id = channel_id.to_string();
        let store = self.store.clone();
        Box::pin(async move { Ok(store.read().await.get(&channel_id).cloned()) })
    }

    fn update_credentials(
        &self,
        channel_id: &str,
        update: &CredentialUpdate,
        expected_updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Channel>>> {
        let channel_id = channel_id.to_string();
        let update = update.clone();
        let store = self.store.clone();
        Box::pin(async move {
            let mut store = store.write().await;
            let channel = store.get_mut(&channel_id).ok_or(DomainError::NotFound)?;
            if channel.updated_at_ms != expected_updated_at_ms {
                return Ok(None);
            }
            channel.access_token = Some(update.access_token);
            channel.refresh_token = Some(update.refresh_token);
            channel.expire_at_ms = Some(update.expire_at_ms);
            // Strictly increasing so a stale conditional update can never match.
            channel.updated_at_ms = self.clock.now_ms().max(channel.updated_at_ms + 1);
            Ok(Some(channel.clone()))
        })
    }

    fn upsert_connected(&self, connect: &ChannelConnect) -> BoxFuture<'_, DomainResult<Channel>> {
        let connect = connect.clone();
        let store = self.store.clone();
        Box::pin(async move {
            if connect.group_id.trim().is_empty() || connect.provider_id.trim().is_empty() {
                return Err(DomainError::Validation(
                    "group_id and provider_id are required".into(),
                ));
            }
            let now_ms = self.clock.now_ms();
            let mut store = store.write().await;
            let existing = store
                .values_mut()
                .find(|channel| {
                    channel.group_id == connect.group_id
                        && channel.provider_id == connect.provider_id
                });
            let credentials = connect.credentials;
            if let Some(channel) = existing {
                channel.access_token = Some(credentials.access_token);
                channel.refresh_token = Some(credentials.refresh_token);
                channel.expire_at_ms = Some(credentials.expire_at_ms);
                channel.updated_at_ms = now_ms.max(channel.updated_at_ms + 1);
                return Ok(channel.clone());
            }
            let channel = Channel {
                id: uuid_v7_without_dashes(),
                provider_id: connect.provider_id,
                group_id: connect.group_id,
                access_token: Some(credentials.access_token),
                refresh_token: Some(credentials.refresh_token),
                expire_at_ms: Some(credentials.expire_at_ms),
                updated_at_ms: now_ms,
            };
            store.insert(channel.id.clone(), channel.clone());
            Ok(channel)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn channel(expire_at_ms: Option<i64>) -> Channel {
        Channel {
            id: "ch-1".into(),
            provider_id: "oa-1".into(),
            group_id: "grp-1".into(),
            access_token: Some(SecretString::new("at-1".into())),
            refresh_token: Some(SecretString::new("rt-1".into())),
            expire_at_ms,
            updated_at_ms: 100,
        }
    }

    fn update(access: &str) -> CredentialUpdate {
        CredentialUpdate {
            access_token: SecretString::new(access.into()),
            refresh_token: SecretString::new(format!("rt-{access}")),
            expire_at_ms: 10_000,
        }
    }

    #[test]
    fn access_token_is_valid_only_before_expiry() {
        let channel = channel(Some(1_000));
        assert!(channel.valid_access_token(999).is_some());
        assert!(channel.valid_access_token(1_000).is_none());
    }

    #[test]
    fn credential_state_reflects_record() {
        let mut record = channel(Some(1_000));
        assert_eq!(record.credential_state(10, false), CredentialState::Valid);
        assert_eq!(record.credential_state(2_000, false), CredentialState::Expired);
        assert_eq!(record.credential_state(2_000, true), CredentialState::Refreshing);
        record.refresh_token = None;
        assert_eq!(
            record.credential_state(10, false),
            CredentialState::Unrecoverable
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", channel(Some(1)));
        assert!(!rendered.contains("at-1"));
        assert!(!rendered.contains("rt-1"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_version() {
        let repo = InMemoryChannelRepository::new();
        repo.insert(channel(None)).await;

        let updated = repo
            .update_credentials("ch-1", &update("at-2"), 100)
            .await
            .expect("update")
            .expect("condition matched");
        assert_eq!(
            updated.access_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("at-2")
        );
        assert!(updated.updated_at_ms > 100);

        let stale = repo
            .update_credentials("ch-1", &update("at-3"), 100)
            .await
            .expect("update");
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn upsert_connected_reuses_existing_group_provider_pair() {
        let repo = InMemoryChannelRepository::new();
        let connect = ChannelConnect {
            group_id: "grp-1".into(),
            provider_id: "oa-9".into(),
            credentials: update("at-1"),
        };
        let first = repo.upsert_connected(&connect).await.expect("create");
        let again = repo
            .upsert_connected(&ChannelConnect {
                credentials: update("at-2"),
                ..connect
            })
            .await
            .expect("replace");
        assert_eq!(first.id, again.id);
        assert_eq!(
            again.access_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("at-2")
        );
    }
}
