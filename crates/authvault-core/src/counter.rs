//! Shared counting backend.
//!
//! Every service instance talks to the same backend; the atomicity of
//! `increment` is the only cross-instance coordination there is.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::CounterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Post-increment count within the current window.
    pub count: u64,
    /// Time left before the window expires. `None` only if the backend
    /// reports a key without expiry.
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, starting a window of `window` when the key
    /// is absent or expired. A key found without expiry gets one.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, CounterError>;

    /// Current state of `key` without counting. `None` when absent or expired.
    async fn snapshot(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    fn snapshot(&self, now: Instant) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            ttl: self.expires_at.map(|at| at.saturating_duration_since(now)),
        }
    }
}

/// In-process counter store. Correct across tasks of one process only; use a
/// networked backend when several instances share a quota.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys. The map otherwise only shrinks when a key is touched again.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, CounterError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).map_or(false, |entry| entry.expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: None,
        });
        entry.count = entry.count.saturating_add(1);
        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + window);
        }
        Ok(entry.snapshot(now))
    }

    async fn snapshot(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.snapshot(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test(start_paused = true)]
    async fn first_increment_sets_expiry() {
        let store = MemoryCounterStore::new();
        let snap = store.increment("k", DAY).await.unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.ttl, Some(DAY));

        tokio::time::advance(Duration::from_secs(60)).await;
        let snap = store.increment("k", DAY).await.unwrap();
        assert_eq!(snap.count, 2);
        // window is anchored to the first increment, not renewed
        assert_eq!(snap.ttl, Some(DAY - Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_starts_new_window() {
        let store = MemoryCounterStore::new();
        for _ in 0..5 {
            store.increment("k", DAY).await.unwrap();
        }
        tokio::time::advance(DAY).await;
        assert!(store.snapshot("k").await.unwrap().is_none());
        let snap = store.increment("k", DAY).await.unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.ttl, Some(DAY));
    }

    #[tokio::test]
    async fn key_without_expiry_is_repaired() {
        let store = MemoryCounterStore::new();
        store.entries.lock().insert(
            "k".into(),
            CounterEntry {
                count: 7,
                expires_at: None,
            },
        );
        let snap = store.increment("k", DAY).await.unwrap();
        assert_eq!(snap.count, 8);
        assert!(snap.ttl.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_keys() {
        let store = MemoryCounterStore::new();
        store.increment("old", Duration::from_secs(10)).await.unwrap();
        store.increment("new", DAY).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_counted_once_each() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("shared", DAY).await.unwrap()
            }));
        }
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().count);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
        let snap = store.snapshot("shared").await.unwrap().unwrap();
        assert_eq!(snap.count, 200);
        assert!(snap.ttl.is_some());
    }
}
