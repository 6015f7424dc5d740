use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::access::AccessPolicy;
use crate::quota::QuotaConfig;
use crate::verification::{DEFAULT_MIN_SCORE, DEFAULT_VERIFY_ENDPOINT};

pub const ENV_LISTEN: &str = "AUTHVAULT_LISTEN";
pub const ENV_DATABASE_URL: &str = "AUTHVAULT_DATABASE_URL";
pub const ENV_REDIS_URL: &str = "AUTHVAULT_REDIS_URL";
pub const ENV_CAPTCHA_SECRET: &str = "AUTHVAULT_CAPTCHA_SECRET";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterBackend {
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub min_score: f64,
    pub timeout_ms: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: DEFAULT_VERIFY_ENDPOINT.into(),
            min_score: DEFAULT_MIN_SCORE,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub listen: String,
    pub database_url: String,
    pub counter: CounterBackend,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub verification: VerificationSettings,
    /// Cross-check lookups against the users table and log orphaned bundles.
    #[serde(default = "enabled")]
    pub identity_diagnostics: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".into(),
            database_url: "sqlite://authvault.db".into(),
            counter: CounterBackend::Memory,
            quota: QuotaConfig::default(),
            access: AccessPolicy::default(),
            verification: VerificationSettings::default(),
            identity_diagnostics: true,
        }
    }
}

impl ServiceConfig {
    /// Load from a JSON file when given, otherwise defaults; then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("open config {}", path.display()))?;
                serde_json::from_reader(file)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(listen) = non_empty_env(ENV_LISTEN) {
            self.listen = listen;
        }
        if let Some(url) = non_empty_env(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(url) = non_empty_env(ENV_REDIS_URL) {
            self.counter = CounterBackend::Redis { url };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.quota.max_requests == 0 {
            return Err(anyhow!("quota.max_requests must be at least 1"));
        }
        if self.quota.window_secs == 0 {
            return Err(anyhow!("quota.window_secs must be at least 1"));
        }
        if self.access.require_verification && !self.verification.enabled {
            return Err(anyhow!(
                "access.require_verification needs verification.enabled"
            ));
        }
        if !(0.0..=1.0).contains(&self.verification.min_score) {
            return Err(anyhow!("verification.min_score must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Captcha secret, read from the environment only.
    pub fn captcha_secret(&self) -> Option<String> {
        non_empty_env(ENV_CAPTCHA_SECRET)
    }
}

fn enabled() -> bool {
    true
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_original_quota() {
        let config = ServiceConfig::default();
        assert_eq!(config.quota.max_requests, 40);
        assert_eq!(config.quota.window_secs, 86_400);
        assert_eq!(config.quota.namespace, "authRateLimiter:");
        assert!(!config.access.require_verification);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_fills_sections_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen":"0.0.0.0:9000","database_url":"sqlite::memory:","counter":{{"kind":"redis","url":"redis://cache:6379"}}}}"#
        )
        .unwrap();
        let config: ServiceConfig =
            serde_json::from_reader(std::fs::File::open(file.path()).unwrap()).unwrap();
        assert_eq!(
            config.counter,
            CounterBackend::Redis {
                url: "redis://cache:6379".into()
            }
        );
        assert_eq!(config.quota.max_requests, 40);
        assert!(config.identity_diagnostics);
    }

    #[test]
    fn required_verification_without_verifier_is_invalid() {
        let mut config = ServiceConfig::default();
        config.access.require_verification = true;
        assert!(config.validate().is_err());
        config.verification.enabled = true;
        config.validate().unwrap();
    }

    #[test]
    fn zero_quota_is_invalid() {
        let mut config = ServiceConfig::default();
        config.quota.max_requests = 0;
        assert!(config.validate().is_err());
    }
}
