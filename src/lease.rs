//! Cross-instance Lease Lock
//!
//! A named, TTL-bound mutex that keeps two replicas from responding to the same inbound event.
//! Acquisition is delegated to a shared [`LeaseStore`] when one is configured. Any shared-store
//! error degrades to the in-process [`MemoryLeaseStore`], which only excludes holders inside
//! this process: in that mode two replicas can both acquire the same key.
//!
//! [`FileLeaseStore`] coordinates every replica that can reach its directory.
//! [`SledLeaseStore`] is durable but can only be opened by one process at a time.
//!
//! Release is best-effort. A lease that is never released expires after its TTL, which is the
//! only cancellation signal: a stalled holder loses its claim and another replica may restart
//! the work from scratch. [`LeaseLock::release_owned`] only deletes the caller's own lease, so a
//! holder that stalled past its TTL cannot remove the lease of the replica that took over.

pub mod file_store;
pub mod memory;
pub mod sled_store;

pub use file_store::FileLeaseStore;
pub use memory::MemoryLeaseStore;
pub use sled_store::SledLeaseStore;

use crate::config::{LeaseConfig, LeaseStoreKind};
use crate::error::LeaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Persisted lease state, shared by every store that serializes leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    pub fn new(owner: &str, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            owner: owner.to_string(),
            expires_at_ms: now_millis().saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_millis() >= self.expires_at_ms
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Atomic set-if-absent-with-expiry storage for leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `key` for `owner` unless a live lease exists. Check and set are one atomic step.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Delete the lease regardless of owner.
    async fn release(&self, key: &str) -> Result<(), LeaseError>;

    /// Delete the lease only while `owner` holds it. `true` when it was deleted.
    async fn release_owned(&self, key: &str, owner: &str) -> Result<bool, LeaseError>;

    /// Current live holder of `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError>;

    fn name(&self) -> &'static str;
}

/// Which backend decided an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseBackend {
    Shared,
    /// In-process only. No cross-replica exclusion.
    Local,
}

impl fmt::Display for LeaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseBackend::Shared => write!(f, "shared"),
            LeaseBackend::Local => write!(f, "local"),
        }
    }
}

/// Result of one acquisition attempt. `acquired == false` means lock contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOutcome {
    pub acquired: bool,
    pub owner: String,
    pub backend: LeaseBackend,
}

pub struct LeaseLock {
    shared: Option<Arc<dyn LeaseStore>>,
    local: MemoryLeaseStore,
    instance_id: String,
    attempts: AtomicU64,
    default_ttl: Duration,
}

impl LeaseLock {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(180);

    /// Lock without a shared store: single-replica deployments only.
    pub fn local_only(instance_id: impl Into<String>) -> Self {
        Self {
            shared: None,
            local: MemoryLeaseStore::new(),
            instance_id: instance_id.into(),
            attempts: AtomicU64::new(0),
            default_ttl: Self::DEFAULT_TTL,
        }
    }

    pub fn with_shared_store(store: Arc<dyn LeaseStore>, instance_id: impl Into<String>) -> Self {
        Self {
            shared: Some(store),
            ..Self::local_only(instance_id)
        }
    }

    /// Build from configuration. A store path that cannot be opened degrades to local-only.
    pub fn from_config(config: &LeaseConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(default_instance_id);
        let lock = match &config.store_path {
            Some(path) => match open_store(config.store, path) {
                Ok(store) => Self::with_shared_store(store, instance_id),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "Lease store unavailable; using in-process leases (no cross-replica guarantee)"
                    );
                    Self::local_only(instance_id)
                }
            },
            None => {
                warn!("No lease store configured; leases only exclude work within this process");
                Self::local_only(instance_id)
            }
        };
        lock.with_default_ttl(config.ttl())
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn has_shared_store(&self) -> bool {
        self.shared.is_some()
    }

    pub async fn acquire(&self, key: &str, ttl: Duration) -> LeaseOutcome {
        let owner = self.next_owner();

        if let Some(shared) = &self.shared {
            match shared.try_acquire(key, &owner, ttl).await {
                Ok(acquired) => {
                    debug!(key, owner = %owner, acquired, store = shared.name(), "Lease attempt");
                    return LeaseOutcome {
                        acquired,
                        owner,
                        backend: LeaseBackend::Shared,
                    };
                }
                Err(err) => {
                    warn!(
                        key,
                        owner = %owner,
                        error = %err,
                        "Shared lease store failed; falling back to in-process lease"
                    );
                }
            }
        }

        let acquired = self.local.acquire_now(key, &owner, ttl);
        debug!(key, owner = %owner, acquired, store = "memory", "Lease attempt");
        LeaseOutcome {
            acquired,
            owner,
            backend: LeaseBackend::Local,
        }
    }

    pub async fn acquire_default(&self, key: &str) -> LeaseOutcome {
        self.acquire(key, self.default_ttl).await
    }

    /// Best-effort delete on every backend. Never fails.
    pub async fn release(&self, key: &str) {
        if let Some(shared) = &self.shared {
            if let Err(err) = shared.release(key).await {
                warn!(key, error = %err, "Failed to release shared lease; it will expire");
            }
        }
        self.local.release_now(key);
    }

    /// Delete the lease acquired as `owner`, leaving any later holder alone. Never fails.
    pub async fn release_owned(&self, key: &str, owner: &str) {
        if let Some(shared) = &self.shared {
            match shared.release_owned(key, owner).await {
                Ok(true) => {}
                Ok(false) => debug!(key, owner, "Lease already expired or taken over"),
                Err(err) => {
                    warn!(key, owner, error = %err, "Failed to release shared lease; it will expire")
                }
            }
        }
        self.local.release_owned_now(key, owner);
    }

    /// Current holder, from the shared store when reachable.
    pub async fn holder(&self, key: &str) -> Option<LeaseRecord> {
        if let Some(shared) = &self.shared {
            if let Ok(holder) = shared.holder(key).await {
                return holder;
            }
        }
        self.local.holder_now(key)
    }

    fn next_owner(&self) -> String {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}#{}", self.instance_id, attempt)
    }
}

fn open_store(kind: LeaseStoreKind, path: &Path) -> Result<Arc<dyn LeaseStore>, LeaseError> {
    Ok(match kind {
        LeaseStoreKind::File => Arc::new(FileLeaseStore::open(path)?),
        LeaseStoreKind::Sled => Arc::new(SledLeaseStore::open(path)?),
    })
}

/// `{host}-{pid}-{hash}` where the hash mixes in the start time, so restarts of the same
/// process id on the same host stay distinguishable.
pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let pid = std::process::id();
    let seed = format!("{}:{}:{}", host, pid, chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
    let digest = blake3::hash(seed.as_bytes());
    format!("{}-{}-{}", host, pid, hex::encode(&digest.as_bytes()[..4]))
}
