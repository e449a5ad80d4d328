use std::sync::Arc;
use std::time::Duration;

use chanlink_domain::debounce::{DEAD_LETTER_KEY, DebounceAggregator};
use chanlink_domain::ports::coordination::CoordinationStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::observability;

/// Periodically re-arms orphaned debounce buffers and reports the
/// dead-letter depth until `shutdown` flips to `true`.
pub fn spawn_maintenance(
    aggregator: DebounceAggregator,
    store: Arc<dyn CoordinationStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            run_once(&aggregator, store.as_ref()).await;
        }
        tracing::debug!("maintenance loop stopped");
    })
}

async fn run_once(aggregator: &DebounceAggregator, store: &dyn CoordinationStore) {
    match aggregator.recover_orphans().await {
        Ok(0) => {}
        Ok(recovered) => {
            observability::register_orphans_recovered(recovered);
            tracing::info!(recovered, "orphaned debounce buffers re-armed");
        }
        Err(err) => tracing::warn!(error = %err, "orphan recovery failed"),
    }
    match store.list_len(DEAD_LETTER_KEY).await {
        Ok(depth) => {
            if depth > 0 {
                tracing::warn!(depth, "debounce dead letters pending");
            }
            observability::set_dead_letter_depth(depth);
        }
        Err(err) => tracing::warn!(error = %err, "dead-letter depth check failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlink_domain::clock::MonotonicClock;
    use chanlink_domain::coordination::InMemoryCoordinationStore;
    use chanlink_domain::debounce::{ConversationKey, DebounceConfig};
    use chanlink_domain::dispatch::InMemoryPublisher;

    #[tokio::test(start_paused = true)]
    async fn maintenance_recovers_orphans_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let publisher = Arc::new(InMemoryPublisher::new());
        let aggregator = DebounceAggregator::new(
            store.clone(),
            publisher.clone(),
            Arc::new(MonotonicClock::new()),
            DebounceConfig::default(),
            "instance-b",
        );
        let key = ConversationKey::new("conv-1", "grp-1");
        store
            .list_push(&key.buffer_key(), "\"left behind\"")
            .await
            .expect("push");

        let (tx, rx) = watch::channel(false);
        let handle = spawn_maintenance(
            aggregator.clone(),
            store.clone(),
            Duration::from_secs(30),
            rx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(aggregator.pending_timers(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(publisher.published().len(), 1);

        tx.send(true).expect("loop listening");
        handle.await.expect("loop exits");
        aggregator.shutdown().await;
    }
}
