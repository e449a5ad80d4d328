use std::sync::Arc;
use std::time::Duration;

use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::db::{DbAdapter, DbError};
use secrecy::{ExposeSecret, SecretString};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: SecretString,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }

    /// Surreal's websocket client wants `host:port`, not a URL.
    pub fn socket_address(&self) -> Result<String, DbError> {
        parse_socket_address(&self.endpoint)
    }
}

/// Opens a signed-in websocket session scoped to the configured namespace
/// and database.
pub async fn connect(config: &DbConfig) -> Result<Arc<Surreal<Client>>, DbError> {
    let address = config.socket_address()?;
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(address)
        .await
        .map_err(|err| DbError::Unavailable(format!("surreal connect failed: {err}")))?;
    db.signin(Root {
        username: &config.username,
        password: config.password.expose_secret(),
    })
    .await
    .map_err(|err| DbError::Unauthorized(format!("surreal signin failed: {err}")))?;
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|err| DbError::Operation(err.to_string()))?;
    Ok(Arc::new(db))
}

#[derive(Debug, Clone)]
pub struct SurrealAdapter {
    config: DbConfig,
}

impl SurrealAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

impl DbAdapter for SurrealAdapter {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            let address = self.config.socket_address()?;
            let connect = timeout(Duration::from_secs(2), TcpStream::connect(&address))
                .await
                .map_err(|_| {
                    DbError::Unavailable("surreal endpoint connect timed out".to_string())
                })?;
            connect.map_err(|err| {
                DbError::Unavailable(format!("surreal endpoint connect failed: {err}"))
            })?;

            tracing::debug!(
                endpoint = %self.config.endpoint,
                namespace = %self.config.namespace,
                database = %self.config.database,
                "surreal health check succeeded"
            );
            Ok(())
        })
    }
}

fn parse_socket_address(endpoint: &str) -> Result<String, DbError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DbError::InvalidEndpoint(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;

    let host = parsed.host_str().ok_or_else(|| {
        DbError::InvalidEndpoint(format!("missing surreal host in endpoint '{endpoint}'"))
    })?;
    let port = match parsed.scheme() {
        "wss" | "https" => parsed.port().unwrap_or(443),
        _ => parsed.port().unwrap_or(8000),
    };
    Ok(format!("{host}:{port}"))
}
