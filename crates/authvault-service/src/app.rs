use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use authvault_core::config::{CounterBackend, ServiceConfig};
use authvault_core::directory::TracingDiagnostics;
use authvault_core::sqlite::{open_pool, SqliteBundleStore, SqliteIdentityDirectory};
use authvault_core::verification::RecaptchaVerifier;
use authvault_core::{BundleAccessController, CounterStore, MemoryCounterStore, QuotaLimiter};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(600);

pub struct App {
    pub controller: Arc<BundleAccessController>,
    pub background: Vec<JoinHandle<()>>,
}

/// Wire the configured backends into a controller.
pub async fn build(config: &ServiceConfig) -> Result<App> {
    let pool = open_pool(&config.database_url, config.access.store_timeout())
        .await
        .with_context(|| format!("open database {}", config.database_url))?;
    let store = Arc::new(SqliteBundleStore::new(pool.clone()));

    let mut background = Vec::new();
    let counters: Arc<dyn CounterStore> = match &config.counter {
        CounterBackend::Memory => {
            let memory = Arc::new(MemoryCounterStore::new());
            background.push(spawn_counter_purge(memory.clone()));
            info!("using in-process quota counters; quotas are not shared across instances");
            memory as Arc<dyn CounterStore>
        }
        CounterBackend::Redis { url } => connect_redis(url).await?,
    };

    let limiter = QuotaLimiter::new(counters, config.quota.clone());
    let mut controller = BundleAccessController::new(limiter, store, config.access.clone());

    if config.verification.enabled {
        let secret = config
            .captcha_secret()
            .ok_or_else(|| anyhow!("verification enabled but captcha secret not set"))?;
        let verifier = RecaptchaVerifier::new(
            config.verification.endpoint.clone(),
            secret,
            config.verification.min_score,
            Duration::from_millis(config.verification.timeout_ms),
        )?;
        controller = controller.with_verifier(Arc::new(verifier));
    }

    if config.identity_diagnostics {
        controller = controller
            .with_directory(Arc::new(SqliteIdentityDirectory::new(pool)))
            .with_diagnostics(Arc::new(TracingDiagnostics));
    }

    Ok(App {
        controller: Arc::new(controller),
        background,
    })
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<Arc<dyn CounterStore>> {
    let store = authvault_core::counter_redis::RedisCounterStore::connect(url)
        .await
        .with_context(|| format!("connect quota backend {url}"))?;
    info!("using redis quota counters");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> Result<Arc<dyn CounterStore>> {
    Err(anyhow!(
        "redis quota backend requested but this build lacks the `redis` feature"
    ))
}

fn spawn_counter_purge(counters: Arc<MemoryCounterStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(COUNTER_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = counters.purge_expired();
            if purged > 0 {
                debug!(purged, "expired quota counters dropped");
            }
        }
    })
}
