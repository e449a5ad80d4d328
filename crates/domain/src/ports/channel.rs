use crate::DomainResult;
use crate::channel::{Channel, ChannelConnect, CredentialUpdate};

use super::BoxFuture;

/// Persistent channel records. The core only reads by id and writes
/// credentials through a conditional update keyed on `updated_at_ms`.
pub trait ChannelRepository: Send + Sync {
    fn get(&self, channel_id: &str) -> BoxFuture<'_, DomainResult<Option<Channel>>>;

    /// Applies `update` only if the stored `updated_at_ms` still equals
    /// `expected_updated_at_ms`. Returns `None` when the condition fails.
    fn update_credentials(
        &self,
        channel_id: &str,
        update: &CredentialUpdate,
        expected_updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Option<Channel>>>;

    /// Creates or replaces the channel for `(group_id, provider_id)` once the
    /// provider handshake has completed.
    fn upsert_connected(&self, connect: &ChannelConnect) -> BoxFuture<'_, DomainResult<Channel>>;
}
