use std::sync::Arc;

use chanlink_domain::DomainResult;
use chanlink_domain::channel::{Channel, ChannelConnect, CredentialUpdate};
use chanlink_domain::clock::{Clock, SystemClock};
use chanlink_domain::error::DomainError;
use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::channel::ChannelRepository;
use chanlink_domain::util::{format_ms_rfc3339, parse_rfc3339_ms, uuid_v7_without_dashes};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

const SELECT_CHANNEL: &str = "SELECT channel_id, provider_id, group_id, access_token, refresh_token, \
        IF expire_at = NONE { NONE } ELSE { <string>expire_at } AS expire_at, updated_at_ms \
     FROM channel";

const SCHEMA: &str = "DEFINE TABLE IF NOT EXISTS channel SCHEMALESS; \
     DEFINE INDEX IF NOT EXISTS channel_id_unique ON TABLE channel FIELDS channel_id UNIQUE; \
     DEFINE INDEX IF NOT EXISTS channel_group_provider_unique ON TABLE channel \
        FIELDS group_id, provider_id UNIQUE;";

#[derive(Clone)]
pub struct SurrealChannelRepository {
    client: Arc<Surreal<Client>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct SurrealChannelRow {
    channel_id: String,
    provider_id: String,
    group_id: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expire_at: Option<String>,
    updated_at_ms: i64,
}

impl SurrealChannelRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self {
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn ensure_schema(&self) -> DomainResult<()> {
        self.client
            .query(SCHEMA)
            .await
            .map_err(Self::map_surreal_error)?
            .check()
            .map_err(Self::map_surreal_error)?;
        Ok(())
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        let message = err.to_string().to_lowercase();
        if message.contains("already exists")
            || message.contains("already contains")
            || message.contains("unique")
        {
            return DomainError::Conflict;
        }
        DomainError::Store(format!("surreal query failed: {message}"))
    }

    fn decode_rows(rows: Vec<Value>) -> DomainResult<Vec<Channel>> {
        rows.into_iter()
            .map(|row| -> DomainResult<Channel> {
                let row = serde_json::from_value::<SurrealChannelRow>(row).map_err(|err| {
                    DomainError::Validation(format!("invalid channel row: {err}"))
                })?;
                Ok(Channel {
                    id: row.channel_id,
                    provider_id: row.provider_id,
                    group_id: row.group_id,
                    access_token: row.access_token.map(SecretString::new),
                    refresh_token: row.refresh_token.map(SecretString::new),
                    expire_at_ms: row.expire_at.as_deref().map(parse_rfc3339_ms).transpose()?,
                    updated_at_ms: row.updated_at_ms,
                })
            })
            .collect()
    }

    async fn fetch(
        &self,
        filter: &str,
        binds: Vec<(&'static str, String)>,
    ) -> DomainResult<Option<Channel>> {
        let mut pending = self
            .client
            .query(format!("{SELECT_CHANNEL} WHERE {filter} LIMIT 1"));
        for bind in binds {
            pending = pending.bind(bind);
        }
        let mut response = pending.await.map_err(Self::map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
        Ok(Self::decode_rows(rows)?.pop())
    }

    async fn fetch_by_id(&self, channel_id: &str) -> DomainResult<Option<Channel>> {
        self.fetch(
            "channel_id = $channel_id",
            vec![("channel_id", channel_id.to_string())],
        )
        .await
    }

    /// Writes credentials guarded by `updated_at_ms`. Returns whether a row
    /// matched.
    async fn write_credentials(
        &self,
        channel_id: &str,
        update: &CredentialUpdate,
        expected_updated_at_ms: i64,
    ) -> DomainResult<bool> {
        let next_updated_at_ms = self.clock.now_ms().max(expected_updated_at_ms + 1);
        let mut response = self
            .client
            .query(
                "UPDATE channel SET \
                    access_token = $access_token, \
                    refresh_token = $refresh_token, \
                    expire_at = <datetime>$expire_at, \
                    updated_at_ms = $next_updated_at_ms \
                 WHERE channel_id = $channel_id AND updated_at_ms = $expected_updated_at_ms \
                 RETURN channel_id",
            )
            .bind(("channel_id", channel_id.to_string()))
            .bind(("access_token", update.access_token.expose_secret().clone()))
            .bind(("refresh_token", update.refresh_token.expose_secret().clone()))
            .bind(("expire_at", format_ms_rfc3339(update.expire_at_ms)))
            .bind(("next_updated_at_ms", next_updated_at_ms))
            .bind(("expected_updated_at_ms", expected_updated_at_ms))
            .await
            .map_err(Self::map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
        Ok(!rows.is_empty())
    }

    async fn create(&self, connect: &ChannelConnect) -> DomainResult<()> {
        let credentials = &connect.credentials;
        self.client
            .query(
                "CREATE channel SET \
                    channel_id = $channel_id, \
                    provider_id = $provider_id, \
                    group_id = $group_id, \
                    access_token = $access_token, \
                    refresh_token = $refresh_token, \
                    expire_at = <datetime>$expire_at, \
                    updated_at_ms = $updated_at_ms",
            )
            .bind(("channel_id", uuid_v7_without_dashes()))
            .bind(("provider_id", connect.provider_id.clone()))
            .bind(("group_id", connect.group_id.clone()))
            .bind(("access_token", credentials.access_token.expose_secret().clone()))
            .bind(("refresh_token", credentials.refresh_token.expose_secret().clone()))
            .bind(("expire_at", format_ms_rfc3339(credentials.expire_at_ms)))
            .bind(("updated_at_ms", self.clock.now_ms()))
            .await
            .map_err(Self::map_surreal_error)?
            .check()
            .map_err(Self::map_surreal_error)?;
        Ok(())
    }

    async fn find_connected(&self, connect: &ChannelConnect) -> DomainResult<Option<Channel>> {
        self.fetch(
            "group_id = $group_id AND provider_id = $provider_id",
            vec![
                ("group_id", connect.group_id.clone()),
                ("provider_id", connect.provider_id.clone()),
            ],
        )
        .await
    }
}

impl ChannelRepository for SurrealChannelRepository {
    fn get(&self, channel_id: &str) -> BoxFuture<'_, DomainResult<Option<Channel>>> {
        let channel_id = channel_id.to_string();
        Box::pin(async move { self.fetch_by_id(&channel_id).await })
    }

    fn update_credentials(
        &self,
        channel_id: &str,
        update: &CredentialUpdate,
        expected_updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Channel>>> {
        let channel_id = channel_id.to_string();
        let update = update.clone();
        Box::pin(async move {
            if !self
                .write_credentials(&channel_id, &update, expected_updated_at_ms)
                .await?
            {
                return match self.fetch_by_id(&channel_id).await? {
                    Some(_) => Ok(None),
                    None => Err(DomainError::NotFound),
                };
            }
            self.fetch_by_id(&channel_id).await
        })
    }

    fn upsert_connected(&self, connect: &ChannelConnect) -> BoxFuture<'_, DomainResult<Channel>> {
        let connect = connect.clone();
        Box::pin(async move {
            if connect.group_id.trim().is_empty() || connect.provider_id.trim().is_empty() {
                return Err(DomainError::Validation(
                    "group_id and provider_id are required".into(),
                ));
            }
            // One retry covers a concurrent create for the same pair.
            for _ in 0..2 {
                if let Some(existing) = self.find_connected(&connect).await? {
                    let written = self
                        .write_credentials(
                            &existing.id,
                            &connect.credentials,
                            existing.updated_at_ms,
                        )
                        .await?;
                    if written {
                        return self
                            .fetch_by_id(&existing.id)
                            .await?
                            .ok_or(DomainError::NotFound);
                    }
                    continue;
                }
                match self.create(&connect).await {
                    Ok(()) => {
                        return self
                            .find_connected(&connect)
                            .await?
                            .ok_or(DomainError::NotFound);
                    }
                    Err(DomainError::Conflict) => continue,
                    Err(err) => return Err(err),
                }
            }
            Err(DomainError::Conflict)
        })
    }
}
