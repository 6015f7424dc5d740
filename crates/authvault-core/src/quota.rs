//! Fixed-window quota limiter over a shared counter store.
//!
//! Each identity gets `max_requests` admissions per window. The window is
//! anchored at the identity's first counted request and reset by expiry in
//! the backend, never manually. Attempts that end up denied are still
//! counted.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::counter::CounterStore;
use crate::error::CounterError;

pub const DEFAULT_MAX_REQUESTS: u64 = 40;
pub const DEFAULT_WINDOW_SECS: u64 = 60 * 60 * 24;
pub const DEFAULT_NAMESPACE: &str = "authRateLimiter:";
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_requests: u64,
    pub window_secs: u64,
    pub namespace: String,
    pub backend_timeout_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            backend_timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
        }
    }
}

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed {
        count: u64,
        remaining: u64,
        reset_after: Option<Duration>,
    },
    Denied {
        count: u64,
        retry_after: Option<Duration>,
    },
    BackendUnavailable {
        reason: String,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

pub struct QuotaLimiter {
    counters: Arc<dyn CounterStore>,
    config: QuotaConfig,
}

impl QuotaLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, config: QuotaConfig) -> Self {
        Self { counters, config }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Backend key for an identity. The empty identity is a valid shared
    /// bucket, not an exemption.
    pub fn counter_key(&self, identity_key: &str) -> String {
        format!("{}{}", self.config.namespace, identity_key)
    }

    /// Count one request for `identity_key` and decide whether it may proceed.
    ///
    /// Exactly one backend round trip, no retry and no local caching.
    pub async fn admit(&self, identity_key: &str) -> QuotaDecision {
        let key = self.counter_key(identity_key);
        let timeout = self.config.backend_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.counters.increment(&key, self.config.window()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CounterError::Timeout(timeout)),
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(key = %key, error = %err, "quota backend unavailable");
                return QuotaDecision::BackendUnavailable {
                    reason: err.to_string(),
                };
            }
        };

        if snapshot.count <= self.config.max_requests {
            debug!(key = %key, count = snapshot.count, "quota admitted");
            QuotaDecision::Allowed {
                count: snapshot.count,
                remaining: self.config.max_requests - snapshot.count,
                reset_after: snapshot.ttl,
            }
        } else {
            debug!(key = %key, count = snapshot.count, "quota exhausted");
            QuotaDecision::Denied {
                count: snapshot.count,
                retry_after: snapshot.ttl,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterSnapshot, MemoryCounterStore};
    use async_trait::async_trait;

    struct DownCounters;

    #[async_trait]
    impl CounterStore for DownCounters {
        async fn increment(&self, _: &str, _: Duration) -> Result<CounterSnapshot, CounterError> {
            Err(CounterError::Unavailable {
                reason: "connection refused".into(),
            })
        }

        async fn snapshot(&self, _: &str) -> Result<Option<CounterSnapshot>, CounterError> {
            Err(CounterError::Unavailable {
                reason: "connection refused".into(),
            })
        }
    }

    struct StalledCounters;

    #[async_trait]
    impl CounterStore for StalledCounters {
        async fn increment(&self, _: &str, _: Duration) -> Result<CounterSnapshot, CounterError> {
            std::future::pending().await
        }

        async fn snapshot(&self, _: &str) -> Result<Option<CounterSnapshot>, CounterError> {
            std::future::pending().await
        }
    }

    fn limiter(counters: Arc<dyn CounterStore>) -> QuotaLimiter {
        QuotaLimiter::new(counters, QuotaConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn forty_first_request_is_denied() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        for i in 1..=40 {
            match limiter.admit("alice@example.com").await {
                QuotaDecision::Allowed { count, remaining, .. } => {
                    assert_eq!(count, i);
                    assert_eq!(remaining, 40 - i);
                }
                other => panic!("request {i} should be allowed, got {other:?}"),
            }
        }
        match limiter.admit("alice@example.com").await {
            QuotaDecision::Denied { count, retry_after } => {
                assert_eq!(count, 41);
                assert!(retry_after.is_some());
            }
            other => panic!("expected denial, got {other:?}"),
        }
        // other identities are unaffected
        assert!(limiter.admit("bob@example.com").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_count() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        for _ in 0..41 {
            limiter.admit("alice").await;
        }
        assert!(!limiter.admit("alice").await.is_allowed());

        tokio::time::advance(Duration::from_secs(DEFAULT_WINDOW_SECS)).await;
        match limiter.admit("alice").await {
            QuotaDecision::Allowed { count, .. } => assert_eq!(count, 1),
            other => panic!("expected fresh window, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_identity_is_its_own_bucket() {
        let counters = Arc::new(MemoryCounterStore::new());
        let limiter = QuotaLimiter::new(
            counters.clone(),
            QuotaConfig {
                max_requests: 2,
                ..QuotaConfig::default()
            },
        );
        assert!(limiter.admit("").await.is_allowed());
        assert!(limiter.admit("").await.is_allowed());
        assert!(!limiter.admit("").await.is_allowed());
        assert!(limiter.admit("someone").await.is_allowed());
        let snap = counters.snapshot("authRateLimiter:").await.unwrap().unwrap();
        assert_eq!(snap.count, 3);
    }

    #[tokio::test]
    async fn backend_error_is_reported_distinctly() {
        let limiter = limiter(Arc::new(DownCounters));
        match limiter.admit("alice").await {
            QuotaDecision::BackendUnavailable { reason } => {
                assert!(reason.contains("connection refused"));
            }
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out() {
        let limiter = limiter(Arc::new(StalledCounters));
        let decision = limiter.admit("alice").await;
        assert!(matches!(decision, QuotaDecision::BackendUnavailable { .. }));
    }

    #[test]
    fn counter_key_is_namespaced() {
        let limiter = limiter(Arc::new(MemoryCounterStore::new()));
        assert_eq!(limiter.counter_key("a@b.c"), "authRateLimiter:a@b.c");
    }
}
