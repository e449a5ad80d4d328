use thiserror::Error;

use super::BoxFuture;

/// Failures reaching the database that stores channel records.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("channel database unreachable: {0}")]
    Unavailable(String),
    #[error("channel database endpoint is invalid: {0}")]
    InvalidEndpoint(String),
    #[error("channel database rejected credentials: {0}")]
    Unauthorized(String),
    #[error("channel database operation failed: {0}")]
    Operation(String),
}

impl DbError {
    /// Whether retrying the connection later can succeed. Bad endpoints and
    /// bad credentials need an operator.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_) | DbError::Operation(_))
    }
}

/// Startup reachability check for the channel database, run before the
/// repository opens its session.
pub trait DbAdapter: Send + Sync {
    /// Backend label used in startup logs.
    fn name(&self) -> &'static str;
    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>>;
}
