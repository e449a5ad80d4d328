use std::sync::Arc;
use std::time::Duration;

use chanlink_domain::clock::MonotonicClock;
use chanlink_domain::coordination::InMemoryCoordinationStore;
use chanlink_domain::debounce::{
    ConversationKey, DEAD_LETTER_KEY, DebounceAggregator, DebounceConfig, FlushOutcome,
    MessageOutcome,
};
use chanlink_domain::dispatch::{DeadLetterRecord, InMemoryPublisher};
use chanlink_domain::ports::coordination::CoordinationStore;
use serde_json::json;
use tokio::time::{Instant, sleep_until};

const ANCHOR_MS: i64 = 1_750_000_000_000;

struct Node {
    aggregator: DebounceAggregator,
    publisher: InMemoryPublisher,
}

fn config() -> DebounceConfig {
    DebounceConfig {
        quiet_period: Duration::from_secs(10),
        owner_grace: Duration::from_secs(5),
        max_publish_attempts: 3,
        retry_backoff_base: Duration::from_secs(1),
        retry_backoff_max: Duration::from_secs(30),
        ..DebounceConfig::default()
    }
}

fn node(store: &Arc<InMemoryCoordinationStore>, instance_id: &str) -> Node {
    let publisher = InMemoryPublisher::new();
    let aggregator = DebounceAggregator::new(
        store.clone(),
        Arc::new(publisher.clone()),
        Arc::new(MonotonicClock::starting_at(ANCHOR_MS)),
        config(),
        instance_id,
    );
    Node {
        aggregator,
        publisher,
    }
}

async fn at(start: Instant, millis: u64) {
    sleep_until(start + Duration::from_millis(millis)).await;
}

#[tokio::test(start_paused = true)]
async fn burst_is_coalesced_after_quiet_period() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    let start = Instant::now();

    for (i, offset) in [0u64, 2, 4, 6, 8].into_iter().enumerate() {
        at(start, offset * 1_000).await;
        let outcome = a
            .aggregator
            .on_message("conv-1", "grp-1", &json!({ "seq": i }))
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Scheduled);
    }

    at(start, 17_900).await;
    assert!(a.publisher.published().is_empty(), "window still open");

    at(start, 18_100).await;
    let published = a.publisher.published();
    assert_eq!(published.len(), 1);
    let envelope = &published[0].envelope;
    assert_eq!(published[0].routing_key, "ZALO_SEND");
    assert_eq!(envelope.conversation_id, "conv-1");
    assert_eq!(envelope.group_id, "grp-1");
    assert_eq!(envelope.message, json!({ "seq": 4 }));
    assert_eq!(envelope.messages.len(), 5);
    assert_eq!(envelope.messages[0], json!({ "seq": 0 }));

    let key = ConversationKey::new("conv-1", "grp-1");
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 0);
    assert!(store.get(&key.owner_key()).await.unwrap().is_none());
    assert_eq!(a.aggregator.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn conversations_are_debounced_independently() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    let start = Instant::now();

    a.aggregator
        .on_message("conv-1", "grp-1", &json!("hi"))
        .await
        .unwrap();
    at(start, 5_000).await;
    a.aggregator
        .on_message("conv-2", "grp-1", &json!("hello"))
        .await
        .unwrap();

    at(start, 10_100).await;
    let published = a.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].envelope.conversation_id, "conv-1");

    at(start, 15_100).await;
    assert_eq!(a.publisher.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn arrivals_on_a_peer_extend_the_owners_window() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    let b = node(&store, "instance-b");
    let start = Instant::now();

    assert_eq!(
        a.aggregator
            .on_message("conv-1", "grp-1", &json!("first"))
            .await
            .unwrap(),
        MessageOutcome::Scheduled
    );
    at(start, 5_000).await;
    assert_eq!(
        b.aggregator
            .on_message("conv-1", "grp-1", &json!("second"))
            .await
            .unwrap(),
        MessageOutcome::OwnedByPeer
    );

    at(start, 14_900).await;
    assert!(a.publisher.published().is_empty());

    at(start, 15_100).await;
    let published = a.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].envelope.messages.len(), 2);
    assert!(b.publisher.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_is_idempotent() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    let start = Instant::now();

    for text in ["a", "b"] {
        a.aggregator
            .on_message("conv-1", "grp-1", &json!(text))
            .await
            .unwrap();
    }

    let first = a.aggregator.flush("conv-1", "grp-1", "ZALO").await.unwrap();
    let second = a.aggregator.flush("conv-1", "grp-1", "ZALO").await.unwrap();

    assert_eq!(first, FlushOutcome::Published { messages: 2 });
    assert_eq!(second, FlushOutcome::Empty);

    at(start, 20_000).await;
    assert_eq!(a.publisher.published().len(), 1, "timer was disarmed");
}

#[tokio::test(start_paused = true)]
async fn failed_publish_keeps_buffer_and_retries() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    a.publisher.fail_next(1);
    let start = Instant::now();

    a.aggregator
        .on_message("conv-1", "grp-1", &json!("ping"))
        .await
        .unwrap();

    at(start, 10_100).await;
    assert!(a.publisher.published().is_empty());
    let key = ConversationKey::new("conv-1", "grp-1");
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 1);

    at(start, 11_200).await;
    assert_eq!(a.publisher.published().len(), 1);
    assert_eq!(a.publisher.attempts(), 2);
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_publish_attempts_are_dead_lettered() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    a.publisher.fail_next(10);
    let start = Instant::now();

    a.aggregator
        .on_message("conv-1", "grp-1", &json!("ping"))
        .await
        .unwrap();

    // Quiet period, then backoffs of 1s and 2s before the third attempt.
    at(start, 13_500).await;

    assert_eq!(a.publisher.attempts(), 3);
    let parked = store.list_range(DEAD_LETTER_KEY).await.unwrap();
    assert_eq!(parked.len(), 1);
    let record: DeadLetterRecord = serde_json::from_str(&parked[0]).unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.routing_key, "ZALO_SEND");
    assert_eq!(record.envelope.messages, vec![json!("ping")]);

    let key = ConversationKey::new("conv-1", "grp-1");
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 0);
    assert!(store.get(&key.owner_key()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn orphaned_buffer_is_recovered_by_another_instance() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let key = ConversationKey::new("conv-9", "grp-2");
    // Left behind by an instance that crashed after buffering.
    store
        .list_push(&key.buffer_key(), &json!("lost").to_string())
        .await
        .unwrap();

    let b = node(&store, "instance-b");
    let start = Instant::now();

    assert_eq!(b.aggregator.recover_orphans().await.unwrap(), 1);
    assert_eq!(
        b.aggregator.recover_orphans().await.unwrap(),
        0,
        "already armed locally"
    );

    at(start, 10_100).await;
    let published = b.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].envelope.conversation_id, "conv-9");
    assert_eq!(published[0].envelope.group_id, "grp-2");
}

#[tokio::test(start_paused = true)]
async fn orphan_recovery_keeps_group_ids_containing_colons() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let key = ConversationKey::new("conv-1", "tenant:42");
    store
        .list_push(&key.buffer_key(), &json!("lost").to_string())
        .await
        .unwrap();

    let b = node(&store, "instance-b");
    let start = Instant::now();

    assert_eq!(b.aggregator.recover_orphans().await.unwrap(), 1);

    at(start, 10_100).await;
    let published = b.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].envelope.group_id, "tenant:42");
    assert_eq!(published[0].envelope.conversation_id, "conv-1");
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn live_peer_marker_blocks_recovery_until_it_expires() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let key = ConversationKey::new("conv-1", "grp-1");
    store
        .list_push(&key.buffer_key(), &json!("x").to_string())
        .await
        .unwrap();
    store
        .set_if_absent(&key.owner_key(), "instance-gone", Duration::from_secs(15))
        .await
        .unwrap();

    let b = node(&store, "instance-b");
    let start = Instant::now();
    assert_eq!(b.aggregator.recover_orphans().await.unwrap(), 0);

    at(start, 15_100).await;
    assert_eq!(b.aggregator.recover_orphans().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_ownership_for_peers() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let a = node(&store, "instance-a");
    let b = node(&store, "instance-b");
    let start = Instant::now();

    a.aggregator
        .on_message("conv-1", "grp-1", &json!("bye"))
        .await
        .unwrap();
    a.aggregator.shutdown().await;

    let key = ConversationKey::new("conv-1", "grp-1");
    assert_eq!(a.aggregator.pending_timers(), 0);
    assert!(store.get(&key.owner_key()).await.unwrap().is_none());
    assert_eq!(store.list_len(&key.buffer_key()).await.unwrap(), 1);

    assert_eq!(b.aggregator.recover_orphans().await.unwrap(), 1);
    at(start, 10_100).await;
    assert!(a.publisher.published().is_empty());
    assert_eq!(b.publisher.published().len(), 1);
}
