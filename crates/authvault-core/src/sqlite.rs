//! SQLite adapters for the bundle store and identity directory.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::bundle::CredentialBundle;
use crate::directory::{IdentityDirectory, UserRecord};
use crate::error::{DirectoryError, StoreError};
use crate::store::BundleStore;

#[derive(Debug, sqlx::FromRow)]
struct BundleRow {
    iv: String,
    cipher_text: String,
    lookup_key: String,
}

impl From<BundleRow> for CredentialBundle {
    fn from(row: BundleRow) -> Self {
        Self {
            iv: row.iv,
            cipher_text: row.cipher_text,
            lookup_key: row.lookup_key,
        }
    }
}

/// Open (or create) the database at `url` and run pending migrations.
///
/// WAL mode is set on the connection options rather than in a migration
/// because SQLite rejects a journal mode change inside a transaction.
pub async fn open_pool(url: &str, acquire_timeout: Duration) -> Result<SqlitePool, StoreError> {
    let in_memory = url.contains(":memory:");
    let mut opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    if !in_memory {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }
    let mut pool_opts = SqlitePoolOptions::new().acquire_timeout(acquire_timeout);
    pool_opts = if in_memory {
        // every connection to ":memory:" is a separate database, so keep exactly one alive
        pool_opts
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_opts.max_connections(8)
    };
    let pool = pool_opts.connect_with(opts).await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))
}

/// Central store handle. Cheap to clone.
#[derive(Clone)]
pub struct SqliteBundleStore {
    pool: SqlitePool,
}

impl SqliteBundleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl BundleStore for SqliteBundleStore {
    async fn create(&self, bundle: &CredentialBundle) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO authentications (iv, cipher_text, lookup_key, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&bundle.iv)
        .bind(&bundle.cipher_text)
        .bind(&bundle.lookup_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_one_by_lookup_key(
        &self,
        lookup_key: &str,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        let row: Option<BundleRow> = sqlx::query_as(
            "SELECT iv, cipher_text, lookup_key FROM authentications WHERE lookup_key = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(lookup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CredentialBundle::from))
    }
}

#[derive(Clone)]
pub struct SqliteIdentityDirectory {
    pool: SqlitePool,
}

impl SqliteIdentityDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, email: &str) -> Result<i64, DirectoryError> {
        let result = sqlx::query("INSERT INTO users (email, created_at) VALUES (?, ?)")
            .bind(email.to_lowercase())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl IdentityDirectory for SqliteIdentityDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, DirectoryError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, email FROM users WHERE email = ? LIMIT 1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, email)| UserRecord { id, email }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        open_pool("sqlite::memory:", Duration::from_secs(5))
            .await
            .expect("open pool")
    }

    fn bundle(iv: &str, key: &str) -> CredentialBundle {
        CredentialBundle {
            iv: iv.into(),
            cipher_text: "B".into(),
            lookup_key: key.into(),
        }
    }

    #[tokio::test]
    async fn bundle_round_trips_verbatim() {
        let store = SqliteBundleStore::new(memory_pool().await);
        let original = bundle("A", "K");
        store.create(&original).await.unwrap();
        let found = store.find_one_by_lookup_key("K").await.unwrap();
        assert_eq!(found, Some(original));
        assert!(store.find_one_by_lookup_key("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_lookup_keys_return_earliest() {
        let store = SqliteBundleStore::new(memory_pool().await);
        store.create(&bundle("first", "K")).await.unwrap();
        store.create(&bundle("second", "K")).await.unwrap();
        let found = store.find_one_by_lookup_key("K").await.unwrap().unwrap();
        assert_eq!(found.iv, "first");
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("bundles.db").display());
        {
            let store = SqliteBundleStore::new(open_pool(&url, Duration::from_secs(5)).await.unwrap());
            store.create(&bundle("A", "K")).await.unwrap();
            store.pool().close().await;
        }
        let store = SqliteBundleStore::new(open_pool(&url, Duration::from_secs(5)).await.unwrap());
        assert!(store.find_one_by_lookup_key("K").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn directory_lookup_is_by_lowercase_email() {
        let directory = SqliteIdentityDirectory::new(memory_pool().await);
        let id = directory.insert("Alice@Example.com").await.unwrap();
        let found = directory.find_by_email("alice@example.com").await.unwrap();
        assert_eq!(
            found,
            Some(UserRecord {
                id,
                email: "alice@example.com".into()
            })
        );
        assert!(directory.find_by_email("bob@example.com").await.unwrap().is_none());
    }
}
