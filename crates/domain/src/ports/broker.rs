use thiserror::Error;

use super::BoxFuture;
use crate::dispatch::CoalescedEnvelope;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("broker serialization error: {0}")]
    Serialization(String),
}

/// Fire-only publisher. Implementations never retry on their own; callers
/// decide whether a failure is retried or dropped.
pub trait MessagePublisher: Send + Sync {
    fn publish(
        &self,
        envelope: &CoalescedEnvelope,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), PublishError>>;
}
