//! authvault-core: storage and access control for client-encrypted
//! credential bundles.
//!
//! The server never sees plaintext: a bundle is an IV, a ciphertext and a
//! lookup key, all produced by the client. What this crate owns is who may
//! write a bundle (human verification) and how often an identity may read
//! one (a fixed-window quota kept in a counter store shared by every
//! service instance).

pub mod access;
pub mod bundle;
pub mod config;
pub mod counter;
#[cfg(feature = "redis")]
pub mod counter_redis;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod quota;
pub mod sqlite;
pub mod store;
pub mod verification;

pub use access::{AccessPolicy, BundleAccessController, CreateBundleRequest, LookupOutcome};
pub use bundle::{CredentialBundle, NewBundle};
pub use counter::{CounterSnapshot, CounterStore, MemoryCounterStore};
pub use error::{AccessError, CounterError, StoreError};
pub use quota::{QuotaConfig, QuotaDecision, QuotaLimiter};
pub use store::{BundleStore, MemoryBundleStore};
