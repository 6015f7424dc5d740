//! Identity directory and the diagnostic side channel it feeds.
//!
//! Neither is allowed to influence a lookup response; they exist so operators
//! can spot bundles whose owner has no account record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DirectoryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, DirectoryError>;
}

pub trait DiagnosticSink: Send + Sync {
    /// A bundle was served for an identity the directory does not know.
    fn orphaned_bundle(&self, email: &str, lookup_key: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl DiagnosticSink for NoopDiagnostics {
    fn orphaned_bundle(&self, _email: &str, _lookup_key: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn orphaned_bundle(&self, email: &str, lookup_key: &str) {
        warn!(
            email = %email,
            lookup_key = %lookup_key,
            "no user found for auth record"
        );
    }
}
