//! Human verification ahead of bundle creation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::VerificationError;

pub const DEFAULT_VERIFY_ENDPOINT: &str = "https://www.google.com/recaptcha/api/siteverify";
pub const DEFAULT_MIN_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub ok: bool,
    pub score: f64,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerificationOutcome, VerificationError>;
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Score-based captcha verification against a `siteverify`-style endpoint.
#[derive(Clone)]
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
    min_score: f64,
}

impl RecaptchaVerifier {
    pub fn new(
        endpoint: impl Into<String>,
        secret: impl Into<String>,
        min_score: f64,
        timeout: Duration,
    ) -> Result<Self, VerificationError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(VerificationError::MissingSecret);
        }
        let client = reqwest::Client::builder()
            .user_agent("authvault/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            secret,
            min_score,
        })
    }

    fn judge(&self, body: &SiteVerifyResponse) -> VerificationOutcome {
        let score = body.score.unwrap_or(0.0);
        VerificationOutcome {
            ok: body.success && score >= self.min_score,
            score,
        }
    }
}

#[async_trait]
impl Verifier for RecaptchaVerifier {
    async fn verify(&self, token: &str) -> Result<VerificationOutcome, VerificationError> {
        let res = self
            .client
            .post(&self.endpoint)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(VerificationError::Status(res.status().as_u16()));
        }
        let body: SiteVerifyResponse = res.json().await?;
        if !body.error_codes.is_empty() {
            tracing::debug!(codes = ?body.error_codes, "verification endpoint reported errors");
        }
        Ok(self.judge(&body))
    }
}
