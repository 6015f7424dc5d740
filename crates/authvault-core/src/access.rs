//! Bundle creation and lookup.
//!
//! Creation is gated by human verification, lookup by the per-identity
//! quota. Persistence and the identity directory are injected so the same
//! controller runs against SQLite in production and in-memory stores in
//! tests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bundle::{CredentialBundle, NewBundle};
use crate::directory::{DiagnosticSink, IdentityDirectory, NoopDiagnostics};
use crate::error::{AccessError, StoreError};
use crate::quota::{QuotaDecision, QuotaLimiter};
use crate::store::BundleStore;
use crate::verification::Verifier;

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Reject creation requests that carry no verification token. When
    /// false, a missing token is logged and the request proceeds.
    pub require_verification: bool,
    pub store_timeout_ms: u64,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            require_verification: false,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl AccessPolicy {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBundleRequest {
    #[serde(flatten)]
    pub bundle: NewBundle,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(CredentialBundle),
    NotFound,
}

pub struct BundleAccessController {
    limiter: QuotaLimiter,
    store: Arc<dyn BundleStore>,
    verifier: Option<Arc<dyn Verifier>>,
    directory: Option<Arc<dyn IdentityDirectory>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    policy: AccessPolicy,
}

impl BundleAccessController {
    /// No verifier and no directory; orphaned-bundle diagnostics are dropped
    /// until a sink is supplied with [`Self::with_diagnostics`].
    pub fn new(limiter: QuotaLimiter, store: Arc<dyn BundleStore>, policy: AccessPolicy) -> Self {
        Self {
            limiter,
            store,
            verifier: None,
            directory: None,
            diagnostics: Arc::new(NoopDiagnostics),
            policy,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn IdentityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn limiter(&self) -> &QuotaLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Verify (when a token is present or required), validate, then persist.
    /// No quota is consumed here.
    pub async fn create(&self, request: CreateBundleRequest) -> Result<(), AccessError> {
        let token = request.token.filter(|t| !t.is_empty());
        match token {
            Some(token) => self.verify(&token).await?,
            None if self.policy.require_verification => {
                warn!("creation rejected: no verification token");
                return Err(AccessError::VerificationRequired);
            }
            None => warn!("no verification token on creation request"),
        }

        let bundle = request.bundle.validate()?;

        // A timed-out write may still commit on the store's side; a client
        // retry can then leave a duplicate row for the same lookup key.
        let timeout = self.policy.store_timeout();
        let result = match tokio::time::timeout(timeout, self.store.create(&bundle)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        result.map_err(|err| {
            error!(error = %err, "error storing credential bundle");
            AccessError::Storage(err)
        })?;
        info!(lookup_key = %bundle.lookup_key, "credential bundle stored");
        Ok(())
    }

    async fn verify(&self, token: &str) -> Result<(), AccessError> {
        let Some(verifier) = &self.verifier else {
            if self.policy.require_verification {
                error!("verification required but no verifier configured");
                return Err(AccessError::VerificationFailed);
            }
            warn!("verification token supplied but no verifier configured");
            return Ok(());
        };
        match verifier.verify(token).await {
            Ok(outcome) if outcome.ok => {
                info!(score = outcome.score, "verification passed");
                Ok(())
            }
            Ok(outcome) => {
                warn!(score = outcome.score, "verification failed");
                Err(AccessError::VerificationFailed)
            }
            Err(err) => {
                warn!(error = %err, "verification unavailable");
                Err(AccessError::VerificationFailed)
            }
        }
    }

    /// Quota first, then the store. A backend failure in the quota check
    /// denies the lookup.
    pub async fn lookup(
        &self,
        identity_key: Option<&str>,
        lookup_key: Option<&str>,
    ) -> Result<LookupOutcome, AccessError> {
        match self.limiter.admit(identity_key.unwrap_or_default()).await {
            QuotaDecision::Allowed { .. } => {}
            QuotaDecision::Denied { retry_after, .. } => {
                return Err(AccessError::RateLimited { retry_after });
            }
            QuotaDecision::BackendUnavailable { .. } => {
                return Err(AccessError::RateLimited { retry_after: None });
            }
        }

        let lookup_key = match lookup_key {
            Some(key) if !key.is_empty() => key,
            _ => return Err(AccessError::MissingLookupKey),
        };

        let timeout = self.policy.store_timeout();
        let found = match tokio::time::timeout(timeout, self.store.find_one_by_lookup_key(lookup_key))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
        .map_err(|err| {
            error!(error = %err, "error reading credential bundle");
            AccessError::Storage(err)
        })?;

        if let Some(identity) = identity_key.filter(|i| !i.is_empty()) {
            self.spawn_identity_check(identity, lookup_key, found.is_some());
        }

        Ok(match found {
            Some(bundle) => LookupOutcome::Found(bundle),
            None => LookupOutcome::NotFound,
        })
    }

    // Detached: the response never waits on the directory, and a failure or
    // panic stays inside the spawned task.
    fn spawn_identity_check(&self, identity: &str, lookup_key: &str, bundle_found: bool) {
        let Some(directory) = self.directory.clone() else {
            return;
        };
        let diagnostics = self.diagnostics.clone();
        let email = identity.to_lowercase();
        let lookup_key = lookup_key.to_string();
        let timeout = self.policy.store_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, directory.find_by_email(&email)).await {
                Ok(Ok(None)) if bundle_found => diagnostics.orphaned_bundle(&email, &lookup_key),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(error = %err, "identity check failed"),
                Err(_) => debug!(?timeout, "identity check timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterStore, MemoryCounterStore};
    use crate::quota::QuotaConfig;
    use crate::store::MemoryBundleStore;

    fn controller(policy: AccessPolicy) -> (BundleAccessController, Arc<MemoryBundleStore>) {
        let store = Arc::new(MemoryBundleStore::new());
        let limiter = QuotaLimiter::new(Arc::new(MemoryCounterStore::new()), QuotaConfig::default());
        (
            BundleAccessController::new(limiter, store.clone(), policy),
            store,
        )
    }

    #[tokio::test]
    async fn required_verification_rejects_missing_token() {
        let (controller, store) = controller(AccessPolicy {
            require_verification: true,
            ..AccessPolicy::default()
        });
        let err = controller
            .create(CreateBundleRequest {
                bundle: NewBundle::new("A", "B", "K"),
                token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::VerificationRequired));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_token_counts_as_absent() {
        let (controller, store) = controller(AccessPolicy::default());
        controller
            .create(CreateBundleRequest {
                bundle: NewBundle::new("A", "B", "K"),
                token: Some(String::new()),
            })
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn empty_lookup_key_is_missing() {
        let (controller, _) = controller(AccessPolicy::default());
        let err = controller.lookup(Some("a@b.c"), Some("")).await.unwrap_err();
        assert!(matches!(err, AccessError::MissingLookupKey));
    }

    #[tokio::test]
    async fn missing_identity_shares_the_empty_bucket() {
        let counters = Arc::new(MemoryCounterStore::new());
        let limiter = QuotaLimiter::new(counters.clone(), QuotaConfig::default());
        let controller = BundleAccessController::new(
            limiter,
            Arc::new(MemoryBundleStore::new()),
            AccessPolicy::default(),
        );
        controller.lookup(None, Some("K")).await.unwrap();
        controller.lookup(Some(""), Some("K")).await.unwrap();
        let snap = counters.snapshot("authRateLimiter:").await.unwrap().unwrap();
        assert_eq!(snap.count, 2);
    }
}
