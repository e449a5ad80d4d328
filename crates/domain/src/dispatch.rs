use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::broker::{MessagePublisher, PublishError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteDirection {
    Send,
    Receive,
}

impl RouteDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "SEND",
            Self::Receive => "RECEIVE",
        }
    }
}

impl FromStr for RouteDirection {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SEND" => Ok(Self::Send),
            "RECEIVE" => Ok(Self::Receive),
            other => Err(DomainError::Validation(format!(
                "unknown route direction '{other}'"
            ))),
        }
    }
}

/// `<CHANNEL>_<DIRECTION>`, e.g. `ZALO_SEND`.
pub fn routing_key(channel: &str, direction: RouteDirection) -> String {
    format!(
        "{}_{}",
        channel.trim().to_ascii_uppercase(),
        direction.as_str()
    )
}

/// Coalesced unit handed to the broker after a debounce window closes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoalescedEnvelope {
    /// Most recent payload in the window.
    pub message: Value,
    /// Every buffered payload, oldest first.
    pub messages: Vec<Value>,
    pub conversation_id: String,
    pub group_id: String,
    pub channel: String,
}

impl CoalescedEnvelope {
    /// Builds an envelope from raw buffer entries. Entries that are not JSON
    /// are carried as strings. Returns `None` for an empty buffer.
    pub fn from_buffer(
        conversation_id: &str,
        group_id: &str,
        channel: &str,
        raw: &[String],
    ) -> Option<Self> {
        let messages: Vec<Value> = raw
            .iter()
            .map(|entry| {
                serde_json::from_str(entry).unwrap_or_else(|_| Value::String(entry.clone()))
            })
            .collect();
        let message = messages.last()?.clone();
        Some(Self {
            message,
            messages,
            conversation_id: conversation_id.to_string(),
            group_id: group_id.to_string(),
            channel: channel.to_string(),
        })
    }
}

/// Envelope parked after exhausting publish attempts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub envelope: CoalescedEnvelope,
    pub routing_key: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublishedEnvelope {
    pub routing_key: String,
    pub envelope: CoalescedEnvelope,
}

/// Records publishes in memory. Can be told to fail a number of times to
/// exercise retry paths.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    published: Arc<Mutex<Vec<PublishedEnvelope>>>,
    failures_remaining: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedEnvelope> {
        self.published
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessagePublisher for InMemoryPublisher {
    fn publish(
        &self,
        envelope: &CoalescedEnvelope,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), PublishError>> {
        let record = PublishedEnvelope {
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        };
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok();
            if failing {
                return Err(PublishError::Unavailable("simulated broker outage".into()));
            }
            self.published
                .lock()
                .map_err(|_| PublishError::Unavailable("publisher lock poisoned".into()))?
                .push(record);
            Ok(())
        })
    }
}
