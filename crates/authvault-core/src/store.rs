//! Bundle persistence contract.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::bundle::CredentialBundle;
use crate::error::StoreError;

#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Persist a bundle verbatim. Either the whole record becomes visible or nothing does.
    async fn create(&self, bundle: &CredentialBundle) -> Result<(), StoreError>;

    /// Earliest-created bundle with this lookup key.
    async fn find_one_by_lookup_key(
        &self,
        lookup_key: &str,
    ) -> Result<Option<CredentialBundle>, StoreError>;
}

/// Creation-ordered in-memory store.
#[derive(Default)]
pub struct MemoryBundleStore {
    bundles: RwLock<Vec<CredentialBundle>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn create(&self, bundle: &CredentialBundle) -> Result<(), StoreError> {
        self.bundles.write().push(bundle.clone());
        Ok(())
    }

    async fn find_one_by_lookup_key(
        &self,
        lookup_key: &str,
    ) -> Result<Option<CredentialBundle>, StoreError> {
        Ok(self
            .bundles
            .read()
            .iter()
            .find(|b| b.lookup_key == lookup_key)
            .cloned())
    }
}
