use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::ports::coordination::{CoordinationError, CoordinationStore};
use crate::util::random_token;

pub const TOKEN_LOCK_KIND: &str = "token";

pub fn lock_key(kind: &str, resource_id: &str) -> String {
    format!("lock:{kind}:{resource_id}")
}

/// Mutual exclusion over the shared coordination store. Acquisition never
/// blocks or queues; callers that lose decide whether to poll or give up.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CoordinationError> {
        let token = random_token();
        if !self.store.set_if_absent(key, &token, ttl).await? {
            return Ok(None);
        }
        tracing::debug!(lock_key = key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(Some(LockGuard {
            store: self.store.clone(),
            key: key.to_string(),
            token,
            released: false,
        }))
    }

    /// Deletes `key` only while it still holds `token`.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        self.store.delete_if_equals(key, token).await
    }

    pub async fn is_held(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Runs `work` under the lock and releases it afterwards whatever `work`
    /// returned. `Ok(None)` means the lock was held by someone else.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        work: F,
    ) -> Result<Option<T>, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.acquire(key, ttl).await? else {
            return Ok(None);
        };
        let output = work().await;
        guard.release_logged().await;
        Ok(Some(output))
    }
}

/// Proof of lock ownership. Dropping an unreleased guard schedules a
/// best-effort release on the current runtime; the TTL covers the rest.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(mut self) -> Result<bool, CoordinationError> {
        self.released = true;
        self.store.delete_if_equals(&self.key, &self.token).await
    }

    pub async fn release_logged(self) {
        let key = self.key.clone();
        match self.release().await {
            Ok(true) => tracing::debug!(lock_key = %key, "lock released"),
            Ok(false) => tracing::warn!(
                lock_key = %key,
                "lock expired before release; another holder may own it"
            ),
            Err(err) => tracing::warn!(lock_key = %key, error = %err, "lock release failed"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = store.delete_if_equals(&key, &token).await {
                tracing::warn!(lock_key = %key, error = %err, "deferred lock release failed");
            }
        });
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;

    fn lock() -> (DistributedLock, Arc<InMemoryCoordinationStore>) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        (DistributedLock::new(store.clone()), store)
    }

    #[test]
    fn lock_key_uses_kind_and_resource() {
        assert_eq!(lock_key(TOKEN_LOCK_KIND, "ch-9"), "lock:token:ch-9");
    }

    #[tokio::test]
    async fn second_acquire_fails_while_first_is_live() {
        let (lock, _) = lock();
        let first = lock
            .acquire("lock:token:ch-1", Duration::from_secs(5))
            .await
            .expect("acquire");
        assert!(first.is_some());

        let second = lock
            .acquire("lock:token:ch-1", Duration::from_secs(5))
            .await
            .expect("acquire");
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_holder_cannot_release_successor_lock() {
        let (lock, store) = lock();
        let key = "lock:token:ch-1";
        let slow = lock
            .acquire(key, Duration::from_millis(100))
            .await
            .expect("acquire")
            .expect("first holder");
        let slow_token = slow.token().to_string();

        tokio::time::advance(Duration::from_millis(150)).await;

        let successor = lock
            .acquire(key, Duration::from_secs(5))
            .await
            .expect("acquire")
            .expect("successor after ttl");

        assert!(!lock.release(key, &slow_token).await.expect("release"));
        assert!(!slow.release().await.expect("guard release"));
        assert_eq!(
            store.get(key).await.expect("get").as_deref(),
            Some(successor.token())
        );

        assert!(successor.release().await.expect("release"));
        assert!(!lock.is_held(key).await.expect("is_held"));
    }

    #[tokio::test]
    async fn with_lock_releases_after_work() {
        let (lock, _) = lock();
        let key = "lock:token:ch-2";
        let output = lock
            .with_lock(key, Duration::from_secs(5), || async { 41 + 1 })
            .await
            .expect("with_lock");
        assert_eq!(output, Some(42));
        assert!(!lock.is_held(key).await.expect("is_held"));
    }

    #[tokio::test]
    async fn with_lock_skips_work_when_contended() {
        let (lock, _) = lock();
        let key = "lock:token:ch-3";
        let _held = lock
            .acquire(key, Duration::from_secs(5))
            .await
            .expect("acquire")
            .expect("held");

        let output = lock
            .with_lock(key, Duration::from_secs(5), || async { "ran" })
            .await
            .expect("with_lock");
        assert_eq!(output, None);
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let (lock, _) = lock();
        let key = "lock:token:ch-4";
        {
            let _guard = lock
                .acquire(key, Duration::from_secs(30))
                .await
                .expect("acquire")
                .expect("held");
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!lock.is_held(key).await.expect("is_held"));
    }
}
