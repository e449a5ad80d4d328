use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::clock::Clock;
use crate::dispatch::{CoalescedEnvelope, DeadLetterRecord, RouteDirection, routing_key};
use crate::ports::broker::MessagePublisher;
use crate::ports::coordination::{CoordinationError, CoordinationStore};

pub const BUFFER_PREFIX: &str = "debounce:buffer:";
const OWNER_PREFIX: &str = "debounce:owner:";
const ACTIVITY_PREFIX: &str = "debounce:activity:";
pub const DEAD_LETTER_KEY: &str = "debounce:dead_letter";

const FLUSH_TOTAL: &str = "chanlink_debounce_flush_total";
const MESSAGES_BUFFERED_TOTAL: &str = "chanlink_debounce_messages_buffered_total";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub conversation_id: String,
    pub group_id: String,
}

impl ConversationKey {
    pub fn new(conversation_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            group_id: group_id.into(),
        }
    }

    /// `<group byte length>:<group>:<conversation>`. The length prefix keeps
    /// the split unambiguous when either id contains `:`.
    fn suffix(&self) -> String {
        format!(
            "{}:{}:{}",
            self.group_id.len(),
            self.group_id,
            self.conversation_id
        )
    }

    pub fn buffer_key(&self) -> String {
        format!("{BUFFER_PREFIX}{}", self.suffix())
    }

    pub fn owner_key(&self) -> String {
        format!("{OWNER_PREFIX}{}", self.suffix())
    }

    pub fn activity_key(&self) -> String {
        format!("{ACTIVITY_PREFIX}{}", self.suffix())
    }

    /// Inverse of `buffer_key`.
    pub fn from_buffer_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(BUFFER_PREFIX)?;
        let (group_len, tail) = rest.split_once(':')?;
        let group_len = group_len.parse::<usize>().ok()?;
        let group_id = tail.get(..group_len)?;
        let conversation_id = tail.get(group_len..)?.strip_prefix(':')?;
        if group_id.is_empty() || conversation_id.is_empty() {
            return None;
        }
        Some(Self::new(conversation_id, group_id))
    }
}

#[derive(Clone, Debug)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
    /// Added to every owner-marker TTL so a marker outlives the local sleep.
    pub owner_grace: Duration,
    pub max_publish_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub channel: String,
    pub direction: RouteDirection,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(10),
            owner_grace: Duration::from_secs(5),
            max_publish_attempts: 5,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
            channel: "ZALO".to_string(),
            direction: RouteDirection::Send,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// This instance owns the pending flush and (re)armed its timer.
    Scheduled,
    /// Another instance owns the pending flush; it will see the activity stamp.
    OwnedByPeer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Published { messages: usize },
    Deferred { remaining: Duration },
    Retrying { attempt: u32 },
    DeadLettered { messages: usize },
    OwnedByPeer,
    InFlight,
}

impl FlushOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Published { .. } => "published",
            Self::Deferred { .. } => "deferred",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::OwnedByPeer => "owned_by_peer",
            Self::InFlight => "in_flight",
        }
    }
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
    failed_attempts: u32,
}

enum FiredTimer {
    Superseded,
    Busy { failed_attempts: u32 },
    Due { failed_attempts: u32 },
}

#[derive(Default)]
struct TimerRegistry {
    timers: HashMap<ConversationKey, TimerEntry>,
    flushing: HashSet<ConversationKey>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    publisher: Arc<dyn MessagePublisher>,
    clock: Arc<dyn Clock>,
    config: DebounceConfig,
    instance_id: String,
    registry: Mutex<TimerRegistry>,
    next_generation: AtomicU64,
}

/// Collapses bursts of inbound messages per conversation into one broker
/// publish once the conversation has been quiet for `quiet_period`.
///
/// Buffers live in the coordination store. The pending flush is owned by one
/// instance at a time through an owner marker; the sleep itself is local and
/// tracked in a registry owned by this aggregator.
#[derive(Clone)]
pub struct DebounceAggregator {
    inner: Arc<Inner>,
}

impl DebounceAggregator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        publisher: Arc<dyn MessagePublisher>,
        clock: Arc<dyn Clock>,
        config: DebounceConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                publisher,
                clock,
                config,
                instance_id: instance_id.into(),
                registry: Mutex::new(TimerRegistry::default()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn pending_timers(&self) -> usize {
        self.registry().timers.len()
    }

    pub async fn on_message(
        &self,
        conversation_id: &str,
        group_id: &str,
        payload: &Value,
    ) -> Result<MessageOutcome, CoordinationError> {
        let key = ConversationKey::new(conversation_id, group_id);
        let raw = serde_json::to_string(payload)
            .map_err(|err| CoordinationError::Serialization(err.to_string()))?;
        let store = &self.inner.store;

        let buffered = store.list_push(&key.buffer_key(), &raw).await?;
        store
            .set(
                &key.activity_key(),
                &self.inner.clock.now_ms().to_string(),
                Some(self.activity_ttl()),
            )
            .await?;
        counter!(MESSAGES_BUFFERED_TOTAL).increment(1);

        if !self.claim_owner(&key, self.owner_ttl(self.inner.config.quiet_period)).await? {
            tracing::debug!(
                conversation_id,
                group_id,
                buffered,
                "pending flush owned by another instance"
            );
            return Ok(MessageOutcome::OwnedByPeer);
        }

        self.arm(key, self.inner.config.quiet_period, None);
        tracing::debug!(conversation_id, group_id, buffered, "debounce timer armed");
        Ok(MessageOutcome::Scheduled)
    }

    /// Reads the whole buffer and publishes it as one envelope. An empty
    /// buffer is a no-op, so a duplicate call never publishes twice.
    pub async fn flush(
        &self,
        conversation_id: &str,
        group_id: &str,
        channel_key: &str,
    ) -> Result<FlushOutcome, CoordinationError> {
        let key = ConversationKey::new(conversation_id, group_id);
        if !self.begin_flushing(&key) {
            return Ok(FlushOutcome::InFlight);
        }
        let failed_attempts = self.failed_attempts(&key);
        let outcome = self.flush_buffer(&key, channel_key, failed_attempts).await;
        self.end_flushing(&key);
        outcome
    }

    /// Re-arms buffers that no instance owns, e.g. after a crash.
    pub async fn recover_orphans(&self) -> Result<usize, CoordinationError> {
        let keys = self.inner.store.scan_prefix(BUFFER_PREFIX).await?;
        let mut recovered = 0;
        for buffer_key in keys {
            let Some(key) = ConversationKey::from_buffer_key(&buffer_key) else {
                tracing::warn!(buffer_key, "skipping unparseable debounce buffer key");
                continue;
            };
            if self.has_local_timer(&key) {
                continue;
            }
            if self.inner.store.get(&key.owner_key()).await?.is_some() {
                continue;
            }
            if !self
                .claim_owner(&key, self.owner_ttl(self.inner.config.quiet_period))
                .await?
            {
                continue;
            }
            tracing::info!(
                conversation_id = %key.conversation_id,
                group_id = %key.group_id,
                "recovered orphaned debounce buffer"
            );
            self.arm(key, self.inner.config.quiet_period, None);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Aborts local timers and gives up owner markers so peers can recover
    /// the buffers.
    pub async fn shutdown(&self) {
        let entries: Vec<(ConversationKey, TimerEntry)> =
            self.registry().timers.drain().collect();
        for (key, entry) in entries {
            entry.handle.abort();
            if let Err(err) = self.release_owner(&key).await {
                tracing::warn!(
                    conversation_id = %key.conversation_id,
                    error = %err,
                    "failed to release debounce owner marker"
                );
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, TimerRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn has_local_timer(&self, key: &ConversationKey) -> bool {
        let registry = self.registry();
        registry.timers.contains_key(key) || registry.flushing.contains(key)
    }

    fn failed_attempts(&self, key: &ConversationKey) -> u32 {
        self.registry()
            .timers
            .get(key)
            .map(|entry| entry.failed_attempts)
            .unwrap_or(0)
    }

    fn begin_flushing(&self, key: &ConversationKey) -> bool {
        self.registry().flushing.insert(key.clone())
    }

    fn end_flushing(&self, key: &ConversationKey) {
        self.registry().flushing.remove(key);
    }

    fn activity_ttl(&self) -> Duration {
        // Long enough to cover the slowest retry schedule.
        let config = &self.inner.config;
        (config.quiet_period + config.retry_backoff_max + config.owner_grace)
            .max(Duration::from_secs(1))
    }

    fn owner_ttl(&self, delay: Duration) -> Duration {
        delay + self.inner.config.owner_grace
    }

    async fn claim_owner(
        &self,
        key: &ConversationKey,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let owner_key = key.owner_key();
        let store = &self.inner.store;
        if store
            .set_if_absent(&owner_key, &self.inner.instance_id, ttl)
            .await?
        {
            return Ok(true);
        }
        store
            .expire_if_equals(&owner_key, &self.inner.instance_id, ttl)
            .await
    }

    async fn release_owner(&self, key: &ConversationKey) -> Result<bool, CoordinationError> {
        self.inner
            .store
            .delete_if_equals(&key.owner_key(), &self.inner.instance_id)
            .await
    }

    /// Replaces any pending local timer for `key`. Failed publish attempts
    /// carry over unless `failed_attempts` overrides them.
    fn arm(&self, key: ConversationKey, delay: Duration, failed_attempts: Option<u32>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        let task_key = key.clone();
        let mut registry = self.registry();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            this.on_timer(task_key, generation).await;
        });
        let previous = registry.timers.remove(&key);
        let failed_attempts = failed_attempts
            .or_else(|| previous.as_ref().map(|entry| entry.failed_attempts))
            .unwrap_or(0);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        registry.timers.insert(
            key,
            TimerEntry {
                generation,
                handle,
                failed_attempts,
            },
        );
    }

    /// Drops timers armed before `before_generation`; newer ones belong to
    /// arrivals that raced with the flush.
    fn disarm_older_than(&self, key: &ConversationKey, before_generation: u64) {
        let mut registry = self.registry();
        let stale = registry
            .timers
            .get(key)
            .is_some_and(|entry| entry.generation < before_generation);
        if stale {
            if let Some(entry) = registry.timers.remove(key) {
                entry.handle.abort();
            }
        }
    }

    /// Detaches the firing timer from the registry so that re-arming from
    /// inside the task never aborts the task itself.
    fn take_fired(&self, key: &ConversationKey, generation: u64) -> FiredTimer {
        let mut registry = self.registry();
        let Some(entry) = registry.timers.get(key) else {
            return FiredTimer::Superseded;
        };
        if entry.generation != generation {
            return FiredTimer::Superseded;
        }
        let failed_attempts = entry.failed_attempts;
        registry.timers.remove(key);
        if registry.flushing.insert(key.clone()) {
            FiredTimer::Due { failed_attempts }
        } else {
            FiredTimer::Busy { failed_attempts }
        }
    }

    async fn on_timer(&self, key: ConversationKey, generation: u64) {
        let failed_attempts = match self.take_fired(&key, generation) {
            FiredTimer::Superseded => return,
            FiredTimer::Busy { failed_attempts } => {
                // A flush is already running; look again after another window.
                self.arm(key, self.inner.config.quiet_period, Some(failed_attempts));
                return;
            }
            FiredTimer::Due { failed_attempts } => failed_attempts,
        };
        let result = self.run_due(&key, failed_attempts).await;
        self.end_flushing(&key);
        match result {
            Ok(outcome) => tracing::debug!(
                conversation_id = %key.conversation_id,
                group_id = %key.group_id,
                outcome = outcome.as_str(),
                "debounce timer fired"
            ),
            Err(err) => {
                tracing::warn!(
                    conversation_id = %key.conversation_id,
                    group_id = %key.group_id,
                    error = %err,
                    "debounce flush failed, re-arming"
                );
                let attempt = failed_attempts.saturating_add(1);
                self.arm(key, self.backoff(attempt), Some(failed_attempts));
            }
        }
    }

    async fn run_due(
        &self,
        key: &ConversationKey,
        failed_attempts: u32,
    ) -> Result<FlushOutcome, CoordinationError> {
        let quiet_period = self.inner.config.quiet_period;
        if !self.claim_owner(key, self.owner_ttl(quiet_period)).await? {
            return Ok(FlushOutcome::OwnedByPeer);
        }

        // Arrivals on other instances only move the activity stamp.
        if let Some(remaining) = self.remaining_quiet(key).await? {
            self.claim_owner(key, self.owner_ttl(remaining)).await?;
            self.arm(key.clone(), remaining, Some(failed_attempts));
            return Ok(FlushOutcome::Deferred { remaining });
        }

        let channel = self.inner.config.channel.clone();
        self.flush_buffer(key, &channel, failed_attempts).await
    }

    async fn remaining_quiet(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Duration>, CoordinationError> {
        let Some(stamp) = self.inner.store.get(&key.activity_key()).await? else {
            return Ok(None);
        };
        let Ok(last_activity_ms) = stamp.parse::<i64>() else {
            return Ok(None);
        };
        let elapsed_ms = self.inner.clock.now_ms().saturating_sub(last_activity_ms);
        let quiet_ms = self.inner.config.quiet_period.as_millis() as i64;
        if elapsed_ms >= quiet_ms {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis((quiet_ms - elapsed_ms) as u64)))
    }

    async fn flush_buffer(
        &self,
        key: &ConversationKey,
        channel_key: &str,
        failed_attempts: u32,
    ) -> Result<FlushOutcome, CoordinationError> {
        let flush_generation = self.inner.next_generation.load(Ordering::SeqCst);
        let store = &self.inner.store;
        let buffer_key = key.buffer_key();
        let raw = store.list_range(&buffer_key).await?;

        let Some(envelope) =
            CoalescedEnvelope::from_buffer(&key.conversation_id, &key.group_id, channel_key, &raw)
        else {
            self.disarm_older_than(key, flush_generation);
            self.release_owner(key).await?;
            return Ok(self.record(key, FlushOutcome::Empty));
        };

        let routing_key = routing_key(channel_key, self.inner.config.direction);
        match self.inner.publisher.publish(&envelope, &routing_key).await {
            Ok(()) => {
                let remaining = store.list_trim_front(&buffer_key, raw.len()).await?;
                self.settle(key, remaining, flush_generation).await?;
                tracing::info!(
                    conversation_id = %key.conversation_id,
                    group_id = %key.group_id,
                    routing_key,
                    messages = raw.len(),
                    "coalesced messages published"
                );
                Ok(self.record(key, FlushOutcome::Published { messages: raw.len() }))
            }
            Err(err) => {
                let attempt = failed_attempts.saturating_add(1);
                if attempt < self.inner.config.max_publish_attempts {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        conversation_id = %key.conversation_id,
                        group_id = %key.group_id,
                        routing_key,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish failed, buffer kept for retry"
                    );
                    self.claim_owner(key, self.owner_ttl(delay)).await?;
                    self.arm(key.clone(), delay, Some(attempt));
                    return Ok(self.record(key, FlushOutcome::Retrying { attempt }));
                }

                let record = DeadLetterRecord {
                    envelope,
                    routing_key: routing_key.clone(),
                    attempts: attempt,
                    last_error: err.to_string(),
                    failed_at_ms: self.inner.clock.now_ms(),
                };
                let payload = serde_json::to_string(&record)
                    .map_err(|err| CoordinationError::Serialization(err.to_string()))?;
                store.list_push(DEAD_LETTER_KEY, &payload).await?;
                let remaining = store.list_trim_front(&buffer_key, raw.len()).await?;
                self.settle(key, remaining, flush_generation).await?;
                tracing::error!(
                    conversation_id = %key.conversation_id,
                    group_id = %key.group_id,
                    routing_key,
                    attempts = attempt,
                    error = %err,
                    "publish attempts exhausted, envelope dead-lettered"
                );
                Ok(self.record(key, FlushOutcome::DeadLettered { messages: raw.len() }))
            }
        }
    }

    /// Post-publish bookkeeping: re-arm when messages arrived during the
    /// publish, otherwise clear activity, marker and timer.
    async fn settle(
        &self,
        key: &ConversationKey,
        remaining: u64,
        flush_generation: u64,
    ) -> Result<(), CoordinationError> {
        if remaining > 0 {
            self.claim_owner(key, self.owner_ttl(self.inner.config.quiet_period))
                .await?;
            self.arm(key.clone(), self.inner.config.quiet_period, Some(0));
            return Ok(());
        }
        self.inner.store.delete(&key.activity_key()).await?;
        self.disarm_older_than(key, flush_generation);
        self.release_owner(key).await?;
        Ok(())
    }

    fn record(&self, key: &ConversationKey, outcome: FlushOutcome) -> FlushOutcome {
        counter!(FLUSH_TOTAL, "outcome" => outcome.as_str()).increment(1);
        tracing::trace!(
            conversation_id = %key.conversation_id,
            outcome = outcome.as_str(),
            "flush recorded"
        );
        outcome
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let config = &self.inner.config;
        let base_ms = config.retry_backoff_base.as_millis().max(1) as u64;
        let multiplier = 1u64 << attempt.saturating_sub(1).min(16);
        let delay_ms = base_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(config.retry_backoff_max.as_millis().max(1) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_key_round_trips_conversation_ids_with_colons() {
        let key = ConversationKey::new("zalo:user:42", "grp-7");
        assert_eq!(key.buffer_key(), "debounce:buffer:5:grp-7:zalo:user:42");
        assert_eq!(ConversationKey::from_buffer_key(&key.buffer_key()), Some(key));
        assert_eq!(ConversationKey::from_buffer_key("debounce:buffer:grp-only"), None);
        assert_eq!(ConversationKey::from_buffer_key("debounce:buffer:9:grp:conv"), None);
        assert_eq!(ConversationKey::from_buffer_key("other:3:grp:conv"), None);
    }

    #[test]
    fn group_ids_with_colons_survive_the_round_trip() {
        let key = ConversationKey::new("conv-1", "tenant:42");
        assert_eq!(key.buffer_key(), "debounce:buffer:9:tenant:42:conv-1");
        let parsed = ConversationKey::from_buffer_key(&key.buffer_key()).expect("parse");
        assert_eq!(parsed.group_id, "tenant:42");
        assert_eq!(parsed.conversation_id, "conv-1");
    }
}
