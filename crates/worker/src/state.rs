use std::sync::Arc;

use chanlink_domain::clock::{Clock, SystemClock};
use chanlink_domain::debounce::DebounceAggregator;
use chanlink_domain::oauth::AuthorizationService;
use chanlink_domain::ports::broker::MessagePublisher;
use chanlink_domain::ports::channel::ChannelRepository;
use chanlink_domain::ports::coordination::CoordinationStore;
use chanlink_domain::ports::db::DbAdapter;
use chanlink_domain::ports::provider::TokenProvider;
use chanlink_domain::token::TokenLifecycleManager;
use chanlink_infra::broker::AmqpPublisher;
use chanlink_infra::config::AppConfig;
use chanlink_infra::coordination::RedisCoordinationStore;
use chanlink_infra::db::{self, DbConfig, SurrealAdapter};
use chanlink_infra::provider_client::HttpTokenProvider;
use chanlink_infra::repositories::SurrealChannelRepository;

/// Adapters behind the services. Production wires Redis, SurrealDB, the
/// provider's HTTP endpoint and AMQP; tests wire the in-memory ones.
pub struct Adapters {
    pub store: Arc<dyn CoordinationStore>,
    pub channels: Arc<dyn ChannelRepository>,
    pub provider: Arc<dyn TokenProvider>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub aggregator: DebounceAggregator,
    pub tokens: TokenLifecycleManager,
    pub authorization: AuthorizationService,
}

impl AppState {
    /// Connects every backing service. The broker publisher is returned as
    /// well so the caller can run its supervisor and close it on shutdown.
    pub async fn connect(
        config: AppConfig,
        instance_id: &str,
    ) -> anyhow::Result<(Self, AmqpPublisher)> {
        let store =
            RedisCoordinationStore::connect_with_prefix(&config.redis_url, &config.redis_key_prefix)
                .await?;
        store.ping().await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let db_config = DbConfig::from_app_config(&config);
        let surreal = SurrealAdapter::new(db_config.clone());
        if let Err(err) = surreal.health_check().await {
            tracing::error!(
                adapter = surreal.name(),
                transient = err.is_transient(),
                error = %err,
                "database check failed"
            );
            return Err(err.into());
        }
        tracing::info!(adapter = surreal.name(), endpoint = %db_config.endpoint, "database reachable");
        let client = db::connect(&db_config).await?;
        let channels = SurrealChannelRepository::with_client(client).with_clock(clock.clone());
        channels.ensure_schema().await?;

        let provider = HttpTokenProvider::new(config.provider_client())?;

        let publisher = AmqpPublisher::new(config.amqp());
        if let Err(err) = publisher.connect().await {
            tracing::warn!(error = %err, "broker unavailable at startup, supervisor will retry");
        }

        let adapters = Adapters {
            store: Arc::new(store),
            channels: Arc::new(channels),
            provider: Arc::new(provider),
            publisher: Arc::new(publisher.clone()),
            clock,
        };
        let state = Self::with_adapters(config, instance_id, adapters)?;
        Ok((state, publisher))
    }

    pub fn with_adapters(
        config: AppConfig,
        instance_id: &str,
        adapters: Adapters,
    ) -> anyhow::Result<Self> {
        let aggregator = DebounceAggregator::new(
            adapters.store.clone(),
            adapters.publisher,
            adapters.clock.clone(),
            config.debounce()?,
            instance_id,
        );
        let tokens = TokenLifecycleManager::new(
            adapters.channels.clone(),
            adapters.provider.clone(),
            adapters.store.clone(),
            adapters.clock.clone(),
            config.token_lifecycle(),
        )?;
        let authorization = AuthorizationService::new(
            adapters.store.clone(),
            adapters.provider,
            adapters.channels,
            adapters.clock,
            config.authorization(),
        );
        Ok(Self {
            config,
            store: adapters.store,
            aggregator,
            tokens,
            authorization,
        })
    }
}
