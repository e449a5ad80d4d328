use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chanlink_domain::dispatch::CoalescedEnvelope;
use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::broker::{MessagePublisher, PublishError};
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use metrics::{counter, histogram};
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const PERSISTENT: u8 = 2;
const PUBLISH_TOTAL: &str = "chanlink_broker_publish_total";
const PUBLISH_SECONDS: &str = "chanlink_broker_publish_duration_seconds";
const RECONNECT_TOTAL: &str = "chanlink_broker_reconnect_total";

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub queue_prefix: String,
    pub reconnect_backoff: Duration,
}

impl AmqpConfig {
    pub fn queue_name(&self, routing_key: &str) -> String {
        format!("{}.{routing_key}", self.queue_prefix)
    }
}

#[derive(Clone)]
struct Session {
    connection: Arc<Connection>,
    channel: Channel,
}

/// Publishes envelopes to a durable topic exchange with publisher confirms.
///
/// The connection is owned by a supervisor task (`spawn_supervisor`). While
/// it is down, `publish` fails immediately instead of waiting.
#[derive(Clone)]
pub struct AmqpPublisher {
    config: AmqpConfig,
    session: Arc<RwLock<Option<Session>>>,
    declared: Arc<Mutex<HashSet<String>>>,
    connection_lost: Arc<Notify>,
}

impl AmqpPublisher {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            session: Arc::new(RwLock::new(None)),
            declared: Arc::new(Mutex::new(HashSet::new())),
            connection_lost: Arc::new(Notify::new()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|session| session.connection.status().connected())
    }

    /// Opens the first connection. Startup fails when the broker is down.
    pub async fn connect(&self) -> Result<(), PublishError> {
        let session = self.open_session().await?;
        self.install(session).await;
        Ok(())
    }

    /// Keeps the connection alive with a fixed reconnect backoff until
    /// `shutdown` flips to `true`, then closes it.
    pub fn spawn_supervisor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if !publisher.is_connected().await {
                    publisher.drop_session().await;
                    match publisher.open_session().await {
                        Ok(session) => {
                            counter!(RECONNECT_TOTAL, "result" => "connected").increment(1);
                            tracing::info!(exchange = %publisher.config.exchange, "broker connected");
                            publisher.install(session).await;
                        }
                        Err(err) => {
                            counter!(RECONNECT_TOTAL, "result" => "failed").increment(1);
                            tracing::warn!(
                                error = %err,
                                retry_in_ms = publisher.config.reconnect_backoff.as_millis() as u64,
                                "broker connection failed"
                            );
                        }
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = publisher.connection_lost.notified() => {}
                    _ = sleep(publisher.config.reconnect_backoff) => {}
                }
            }
            publisher.close().await;
        })
    }

    pub async fn close(&self) {
        let Some(session) = self.session.write().await.take() else {
            return;
        };
        if let Err(err) = session.connection.close(200, "shutdown").await {
            tracing::debug!(error = %err, "broker connection close failed");
        }
    }

    async fn open_session(&self) -> Result<Session, PublishError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        let lost = self.connection_lost.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "broker connection error");
            lost.notify_one();
        });
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        Ok(Session {
            connection: Arc::new(connection),
            channel,
        })
    }

    async fn install(&self, session: Session) {
        self.declared.lock().await.clear();
        *self.session.write().await = Some(session);
    }

    async fn drop_session(&self) {
        self.session.write().await.take();
    }

    async fn current(&self) -> Result<Session, PublishError> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|session| session.connection.status().connected())
            .cloned()
            .ok_or_else(|| PublishError::Unavailable("broker not connected".to_string()))
    }

    async fn ensure_queue(&self, channel: &Channel, routing_key: &str) -> Result<(), PublishError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(routing_key) {
            return Ok(());
        }
        let queue = self.config.queue_name(routing_key);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        declared.insert(routing_key.to_string());
        tracing::debug!(queue, routing_key, "broker queue declared");
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        payload: Vec<u8>,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let session = self.current().await?;
        self.ensure_queue(&session.channel, routing_key).await?;
        let confirm = session
            .channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        let confirmation = confirm
            .await
            .map_err(|err| PublishError::Unavailable(err.to_string()))?;
        if confirmation.is_nack() {
            return Err(PublishError::Rejected(format!(
                "broker nacked publish to {routing_key}"
            )));
        }
        Ok(())
    }
}

fn outcome(result: &Result<(), PublishError>) -> &'static str {
    match result {
        Ok(()) => "published",
        Err(PublishError::Unavailable(_)) => "unavailable",
        Err(PublishError::Rejected(_)) => "rejected",
        Err(PublishError::Serialization(_)) => "serialization",
    }
}

impl MessagePublisher for AmqpPublisher {
    fn publish(
        &self,
        envelope: &CoalescedEnvelope,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), PublishError>> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|err| PublishError::Serialization(err.to_string()));
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            let started = Instant::now();
            let result = match payload {
                Ok(payload) => self.publish_confirmed(payload, &routing_key).await,
                Err(err) => Err(err),
            };
            counter!(PUBLISH_TOTAL, "routing_key" => routing_key.clone(), "outcome" => outcome(&result))
                .increment(1);
            histogram!(PUBLISH_SECONDS).record(started.elapsed().as_secs_f64());
            if matches!(result, Err(PublishError::Unavailable(_))) {
                self.connection_lost.notify_one();
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> AmqpConfig {
        AmqpConfig {
            url: "amqp://127.0.0.1:1/%2f".into(),
            exchange: "chanlink.messages".into(),
            queue_prefix: "chanlink".into(),
            reconnect_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn queue_name_is_prefix_and_routing_key() {
        assert_eq!(config().queue_name("ZALO_SEND"), "chanlink.ZALO_SEND");
    }

    #[tokio::test]
    async fn publish_fails_fast_while_disconnected() {
        let publisher = AmqpPublisher::new(config());
        let envelope =
            CoalescedEnvelope::from_buffer("c", "g", "ZALO", &[json!("hi").to_string()])
                .expect("envelope");

        let err = publisher
            .publish(&envelope, "ZALO_SEND")
            .await
            .expect_err("no connection");

        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(!publisher.is_connected().await);
    }

    #[tokio::test]
    async fn supervisor_stops_on_shutdown_signal() {
        let publisher = AmqpPublisher::new(config());
        let (tx, rx) = watch::channel(false);
        let handle = publisher.spawn_supervisor(rx);

        tx.send(true).expect("supervisor listening");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor exits")
            .expect("supervisor task");
    }
}
