//! Newline-delimited JSON envelopes exchanged with the bundle service.

use serde::{Deserialize, Serialize};

use crate::access::{CreateBundleRequest, LookupOutcome};
use crate::bundle::CredentialBundle;
use crate::error::AccessError;

pub const PROTOCOL_VERSION: u32 = 1;

pub const NOT_FOUND_REASON: &str = "No auth record found for provided lookupKey.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: ApiRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub response: ApiResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum ApiRequest {
    Ping,
    CreateBundle(CreateBundleRequest),
    LookupBundle(LookupQuery),
}

/// Query parameters of a lookup. `username` only keys the quota and the
/// diagnostic identity check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupQuery {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub lookup_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum ApiResponse {
    Pong { protocol_version: u32 },
    Created,
    Bundle(CredentialBundle),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// `bad_request`, `not_found`, `rate_limited` or `server_error`.
    pub kind: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
            retry_after_secs: None,
        }
    }
}

impl From<&AccessError> for ErrorBody {
    fn from(err: &AccessError) -> Self {
        Self {
            kind: err.kind().to_string(),
            reason: err.reason(),
            retry_after_secs: err.retry_after().map(ceil_secs),
        }
    }
}

impl From<Result<(), AccessError>> for ApiResponse {
    fn from(result: Result<(), AccessError>) -> Self {
        match result {
            Ok(()) => ApiResponse::Created,
            Err(err) => ApiResponse::Error(ErrorBody::from(&err)),
        }
    }
}

impl From<Result<LookupOutcome, AccessError>> for ApiResponse {
    fn from(result: Result<LookupOutcome, AccessError>) -> Self {
        match result {
            Ok(LookupOutcome::Found(bundle)) => ApiResponse::Bundle(bundle),
            Ok(LookupOutcome::NotFound) => {
                ApiResponse::Error(ErrorBody::new("not_found", NOT_FOUND_REASON))
            }
            Err(err) => ApiResponse::Error(ErrorBody::from(&err)),
        }
    }
}

fn ceil_secs(d: std::time::Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
