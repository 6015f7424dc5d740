use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CounterError {
    #[error("Counter backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Counter backend timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Bundle store timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bundle store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Verification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Verification endpoint returned status {0}")]
    Status(u16),

    #[error("Verification secret not configured")]
    MissingSecret,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Caller-visible failures of the bundle access layer.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Missing one of the required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<&'static str> },

    #[error("Missing queryParam lookupKey.")]
    MissingLookupKey,

    #[error("failed verification")]
    VerificationFailed,

    #[error("Verification token required")]
    VerificationRequired,

    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after: Option<Duration> },

    #[error("storage error")]
    Storage(#[source] StoreError),
}

impl AccessError {
    /// Stable machine code for the transport layer.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::MissingFields { .. }
            | AccessError::MissingLookupKey
            | AccessError::VerificationFailed
            | AccessError::VerificationRequired => "bad_request",
            AccessError::RateLimited { .. } => "rate_limited",
            AccessError::Storage(_) => "server_error",
        }
    }

    /// Human-readable reason sent back to the caller. Never carries backend detail.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AccessError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
