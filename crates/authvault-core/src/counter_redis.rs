//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;

use crate::counter::{CounterSnapshot, CounterStore};
use crate::error::CounterError;

// INCR and PEXPIRE run inside one script so no caller ever observes a counted
// key without expiry. A key that somehow lost its TTL is given one here too.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

const SNAPSHOT_SCRIPT: &str = r#"
local count = redis.call('GET', KEYS[1])
if not count then
  return {0, -2}
end
return {tonumber(count), redis.call('PTTL', KEYS[1])}
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
    increment: Script,
    snapshot: Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            snapshot: Script::new(SNAPSHOT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, CounterError> {
        let mut conn = self.connection.clone();
        let window_ms = window.as_millis().max(1) as u64;
        let (count, ttl_ms): (i64, i64) = self
            .increment
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(to_snapshot(count, ttl_ms))
    }

    async fn snapshot(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError> {
        let mut conn = self.connection.clone();
        let (count, ttl_ms): (i64, i64) = self
            .snapshot
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if ttl_ms == -2 {
            return Ok(None);
        }
        Ok(Some(to_snapshot(count, ttl_ms)))
    }
}

fn to_snapshot(count: i64, ttl_ms: i64) -> CounterSnapshot {
    CounterSnapshot {
        count: count.max(0) as u64,
        ttl: (ttl_ms >= 0).then(|| Duration::from_millis(ttl_ms as u64)),
    }
}

fn unavailable(err: redis::RedisError) -> CounterError {
    CounterError::Unavailable {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_ttl_means_no_expiry() {
        assert_eq!(to_snapshot(3, -1).ttl, None);
        assert_eq!(
            to_snapshot(3, 1500).ttl,
            Some(Duration::from_millis(1500))
        );
    }
}
