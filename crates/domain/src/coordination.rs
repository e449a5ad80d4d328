use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::ports::BoxFuture;
use crate::ports::coordination::{CoordinationError, CoordinationStore};

/// Process-local coordination store with TTL semantics matching the Redis
/// adapter. Expiry runs on the Tokio clock.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCoordinationStore {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

#[derive(Clone, Debug)]
enum MemoryValue {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryEntry>>, CoordinationError> {
        self.inner
            .lock()
            .map_err(|_| CoordinationError::Operation("coordination store lock poisoned".into()))
    }

    fn live_entry<'a>(
        map: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
    ) -> Option<&'a mut MemoryEntry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn wrong_type(key: &str) -> CoordinationError {
        CoordinationError::Operation(format!(
            "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
        ))
    }

    fn deadline(ttl: Duration) -> Instant {
        Instant::now() + ttl.max(Duration::from_millis(1))
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            if Self::live_entry(&mut guard, &key).is_some() {
                return Ok(false);
            }
            guard.insert(
                key,
                MemoryEntry {
                    value: MemoryValue::Text(value),
                    expires_at: Some(Self::deadline(ttl)),
                },
            );
            Ok(true)
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinationError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            match Self::live_entry(&mut guard, &key) {
                Some(MemoryEntry {
                    value: MemoryValue::Text(value),
                    ..
                }) => Ok(Some(value.clone())),
                Some(_) => Err(Self::wrong_type(&key)),
                None => Ok(None),
            }
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<(), CoordinationError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            guard.insert(
                key,
                MemoryEntry {
                    value: MemoryValue::Text(value),
                    expires_at: ttl.map(Self::deadline),
                },
            );
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            let existed = Self::live_entry(&mut guard, &key).is_some();
            guard.remove(&key);
            Ok(existed)
        })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            let matches = matches!(
                Self::live_entry(&mut guard, &key),
                Some(MemoryEntry { value: MemoryValue::Text(value), .. }) if *value == expected
            );
            if matches {
                guard.remove(&key);
            }
            Ok(matches)
        })
    }

    fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            match Self::live_entry(&mut guard, &key) {
                Some(entry) if matches!(&entry.value, MemoryValue::Text(value) if *value == expected) =>
                {
                    entry.expires_at = Some(Self::deadline(ttl));
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            if Self::live_entry(&mut guard, &key).is_none() {
                guard.insert(
                    key.clone(),
                    MemoryEntry {
                        value: MemoryValue::List(VecDeque::new()),
                        expires_at: None,
                    },
                );
            }
            match guard.get_mut(&key).map(|entry| &mut entry.value) {
                Some(MemoryValue::List(items)) => {
                    items.push_back(value);
                    Ok(items.len() as u64)
                }
                _ => Err(Self::wrong_type(&key)),
            }
        })
    }

    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            match Self::live_entry(&mut guard, &key).map(|entry| &entry.value) {
                Some(MemoryValue::List(items)) => Ok(items.iter().cloned().collect()),
                Some(MemoryValue::Text(_)) => Err(Self::wrong_type(&key)),
                None => Ok(Vec::new()),
            }
        })
    }

    fn list_len(&self, key: &str) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            match Self::live_entry(&mut guard, &key).map(|entry| &entry.value) {
                Some(MemoryValue::List(items)) => Ok(items.len() as u64),
                Some(MemoryValue::Text(_)) => Err(Self::wrong_type(&key)),
                None => Ok(0),
            }
        })
    }

    fn list_trim_front(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.guard()?;
            let remaining = match Self::live_entry(&mut guard, &key).map(|entry| &mut entry.value)
            {
                Some(MemoryValue::List(items)) => {
                    let drop_count = count.min(items.len());
                    items.drain(..drop_count);
                    items.len()
                }
                Some(MemoryValue::Text(_)) => return Err(Self::wrong_type(&key)),
                None => return Ok(0),
            };
            // Redis removes empty lists.
            if remaining == 0 {
                guard.remove(&key);
            }
            Ok(remaining as u64)
        })
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut guard = self.guard()?;
            guard.retain(|_, entry| !entry.is_expired(now));
            let mut keys: Vec<String> = guard
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}
