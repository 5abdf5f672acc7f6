//! sled-backed lease store.
//!
//! Leases are JSON [`LeaseRecord`]s in the `leases` tree; acquisition is a compare-and-swap
//! against the value that was read, so a concurrent writer makes the swap fail instead of
//! double-granting the key. Expiry uses wall-clock milliseconds.
//!
//! sled locks its database directory, so only one process can open a store. Leases are shared
//! by every worker of that process and survive its restart, but a second replica pointed at the
//! same path cannot open it. Use [`super::FileLeaseStore`] to coordinate replicas.

use super::{LeaseRecord, LeaseStore};
use crate::error::LeaseError;
use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const TREE_LEASES: &str = "leases";

#[derive(Clone)]
pub struct SledLeaseStore {
    db: Db,
    leases: Tree,
}

impl SledLeaseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LeaseError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| LeaseError::Unavailable(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, LeaseError> {
        let leases = db.open_tree(TREE_LEASES)?;
        Ok(Self { db, leases })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn decode(key: &str, raw: &[u8]) -> Option<LeaseRecord> {
        match serde_json::from_slice(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(key, error = %err, "Discarding unreadable lease record");
                None
            }
        }
    }
}

#[async_trait]
impl LeaseStore for SledLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let current = self.leases.get(key.as_bytes())?;
        if let Some(raw) = &current {
            if let Some(record) = Self::decode(key, raw) {
                if !record.is_expired() {
                    return Ok(false);
                }
            }
        }

        let record = LeaseRecord::new(owner, ttl);
        let encoded = serde_json::to_vec(&record).map_err(|e| LeaseError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let swapped =
            self.leases
                .compare_and_swap(key.as_bytes(), current.as_deref(), Some(encoded))?;
        Ok(swapped.is_ok())
    }

    async fn release(&self, key: &str) -> Result<(), LeaseError> {
        self.leases.remove(key.as_bytes())?;
        Ok(())
    }

    async fn release_owned(&self, key: &str, owner: &str) -> Result<bool, LeaseError> {
        let Some(raw) = self.leases.get(key.as_bytes())? else {
            return Ok(false);
        };
        let held = Self::decode(key, &raw)
            .is_some_and(|record| record.owner == owner && !record.is_expired());
        if !held {
            return Ok(false);
        }
        let swapped = self
            .leases
            .compare_and_swap(key.as_bytes(), Some(raw), None as Option<&[u8]>)?;
        Ok(swapped.is_ok())
    }

    async fn holder(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let Some(raw) = self.leases.get(key.as_bytes())? else {
            return Ok(None);
        };
        Ok(Self::decode(key, &raw).filter(|record| !record.is_expired()))
    }

    fn name(&self) -> &'static str {
        "sled"
    }
}
