//! In-process lease store.

use super::{LeaseRecord, LeaseStore};
use crate::error::LeaseError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MemoryLease {
    owner: String,
    expires_at: Instant,
}

/// Lease map guarded by a single mutex; check and set happen under one guard with no await
/// in between.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, MemoryLease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_now(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return false;
            }
        }
        leases.insert(
            key.to_string(),
            MemoryLease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn release_now(&self, key: &str) {
        self.leases.lock().remove(key);
    }

    /// Remove the lease only while `owner` still holds it.
    pub fn release_owned_now(&self, key: &str, owner: &str) -> bool {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        let held = leases
            .get(key)
            .is_some_and(|lease| lease.owner == owner && lease.expires_at > now);
        if held {
            leases.remove(key);
        }
        held
    }

    pub fn holder_now(&self, key: &str) -> Option<LeaseRecord> {
        let now = Instant::now();
        let leases = self.leases.lock();
        let lease = leases.get(key).filter(|lease| lease.expires_at > now)?;
        let remaining = lease.expires_at.saturating_duration_since(now);
        Some(LeaseRecord::new(&lease.owner, remaining))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        Ok(self.acquire_now(key, owner, ttl))
    }

    async fn release(&self, key: &str) -> Result<(), LeaseError> {
        self.release_now(key);
        Ok(())
    }

    async fn release_owned(&self, key: &str, owner: &str) -> Result<bool, LeaseError> {
        Ok(self.release_owned_now(key, owner))
    }

    async fn holder(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.holder_now(key))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
