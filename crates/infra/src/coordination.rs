use std::time::Duration;

use chanlink_domain::ports::BoxFuture;
use chanlink_domain::ports::coordination::{CoordinationError, CoordinationStore, ttl_ms};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const SCAN_BATCH: usize = 200;

const DELETE_IF_EQUALS: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

const PEXPIRE_IF_EQUALS: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

/// `CoordinationStore` over a shared Redis. Every key is namespaced with
/// `<prefix>:` so several deployments can share one server.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisCoordinationStore {
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| CoordinationError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CoordinationError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.prefix, key)
    }

    pub async fn ping(&self) -> Result<(), CoordinationError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| CoordinationError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

fn namespaced(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

fn strip_namespace<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix(':')
}

fn operation(err: redis::RedisError) -> CoordinationError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        CoordinationError::Unavailable(err.to_string())
    } else {
        CoordinationError::Operation(err.to_string())
    }
}

impl CoordinationStore for RedisCoordinationStore {
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(operation)?;
            Ok(result.is_some())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinationError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.get(key).await.map_err(operation)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<(), CoordinationError>> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_ms(ttl));
            }
            let _: String = cmd.query_async(&mut conn).await.map_err(operation)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: u64 = conn.del(key).await.map_err(operation)?;
            Ok(removed > 0)
        })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = self.key(key);
        let expected = expected.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = redis::Script::new(DELETE_IF_EQUALS)
                .key(&key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(operation)?;
            Ok(removed == 1)
        })
    }

    fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CoordinationError>> {
        let key = self.key(key);
        let expected = expected.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let updated: i64 = redis::Script::new(PEXPIRE_IF_EQUALS)
                .key(&key)
                .arg(expected)
                .arg(ttl_ms(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(operation)?;
            Ok(updated == 1)
        })
    }

    fn list_push(&self, key: &str, value: &str) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.rpush(key, value).await.map_err(operation)
        })
    }

    fn list_range(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.lrange(key, 0, -1).await.map_err(operation)
        })
    }

    fn list_len(&self, key: &str) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.llen(key).await.map_err(operation)
        })
    }

    fn list_trim_front(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFuture<'_, Result<u64, CoordinationError>> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("LTRIM")
                .arg(&key)
                .arg(count as i64)
                .arg(-1)
                .ignore();
            pipeline.cmd("LLEN").arg(&key);
            let (remaining,): (u64,) = pipeline.query_async(&mut conn).await.map_err(operation)?;
            Ok(remaining)
        })
    }

    fn scan_prefix(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        let pattern = format!("{}*", self.key(prefix));
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(operation)?;
                keys.extend(
                    batch
                        .iter()
                        .filter_map(|key| strip_namespace(&self.prefix, key))
                        .map(str::to_string),
                );
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanned_keys_lose_only_their_namespace() {
        let key = namespaced("chanlink", "debounce:buffer:grp-1:conv-1");
        assert_eq!(key, "chanlink:debounce:buffer:grp-1:conv-1");
        assert_eq!(
            strip_namespace("chanlink", &key),
            Some("debounce:buffer:grp-1:conv-1")
        );
        assert_eq!(strip_namespace("chanlink", "chanlinkx:debounce:buffer"), None);
        assert_eq!(strip_namespace("chanlink", "other:key"), None);
    }
}
