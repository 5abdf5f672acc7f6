//! Filesystem lease store.
//!
//! Each key owns a directory of numbered records. A record is written to a private temp file
//! and then hard-linked to the next number; the link fails when that number already exists, so
//! of several replicas racing for the same number exactly one wins. The highest-numbered record
//! is the current state of the key, and a release appends a record with `released` set.
//!
//! Every process that opens the same directory shares the leases, whether on one host or on a
//! shared mount with POSIX link semantics. Opening never takes an exclusive lock.

use super::{now_millis, LeaseRecord, LeaseStore};
use crate::error::LeaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const RECORD_SUFFIX: &str = ".lease";
const TEMP_PREFIX: &str = ".tmp-";
const SCAN_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLease {
    key: String,
    owner: String,
    expires_at_ms: i64,
    #[serde(default)]
    released: bool,
}

impl StoredLease {
    fn is_live(&self) -> bool {
        !self.released && now_millis() < self.expires_at_ms
    }
}

/// Latest record of a key. `lease` is `None` when the record could not be decoded.
struct Current {
    generation: u64,
    lease: Option<StoredLease>,
}

impl Current {
    fn live(&self) -> Option<&StoredLease> {
        self.lease.as_ref().filter(|lease| lease.is_live())
    }
}

pub struct FileLeaseStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FileLeaseStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LeaseError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.root.join(hex::encode(&digest.as_bytes()[..16]))
    }

    fn current(&self, key: &str, dir: &Path) -> Result<Option<Current>, LeaseError> {
        for _ in 0..SCAN_ATTEMPTS {
            let Some(generation) = latest_generation(dir)? else {
                return Ok(None);
            };
            match fs::read(record_path(dir, generation)) {
                Ok(raw) => {
                    let lease = match serde_json::from_slice(&raw) {
                        Ok(lease) => Some(lease),
                        Err(err) => {
                            warn!(key, generation, error = %err, "Unreadable lease record; treating key as free");
                            None
                        }
                    };
                    return Ok(Some(Current { generation, lease }));
                }
                // Pruned after a newer record landed: scan again.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(dir, err)),
            }
        }
        Err(LeaseError::Unavailable(format!(
            "lease records for {} kept changing while scanning",
            key
        )))
    }

    /// Publish `lease` as record `generation`. `false` when another writer got there first.
    fn append(&self, dir: &Path, generation: u64, lease: &StoredLease) -> Result<bool, LeaseError> {
        let encoded = serde_json::to_vec(lease).map_err(|e| LeaseError::Corrupt {
            key: lease.key.clone(),
            message: e.to_string(),
        })?;
        let temp = dir.join(format!(
            "{}{}-{}-{}",
            TEMP_PREFIX,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        write_synced(&temp, &encoded).map_err(|e| io_error(&temp, e))?;

        let linked = fs::hard_link(&temp, record_path(dir, generation));
        if let Err(err) = fs::remove_file(&temp) {
            debug!(path = %temp.display(), error = %err, "Failed to remove lease temp file");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(dir, err)),
        }
    }

    /// Drop records below `generation`. Failures only leave extra files behind.
    fn prune(&self, dir: &Path, generation: u64) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(older) = parse_generation(&name.to_string_lossy()) {
                if older < generation {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    fn release_record(current: &Current, key: &str) -> StoredLease {
        let owner = current
            .lease
            .as_ref()
            .map(|lease| lease.owner.clone())
            .unwrap_or_default();
        StoredLease {
            key: key.to_string(),
            owner,
            expires_at_ms: now_millis(),
            released: true,
        }
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let next = match self.current(key, &dir)? {
            Some(current) if current.live().is_some() => return Ok(false),
            Some(current) => current.generation + 1,
            None => 1,
        };
        let record = LeaseRecord::new(owner, ttl);
        let lease = StoredLease {
            key: key.to_string(),
            owner: record.owner,
            expires_at_ms: record.expires_at_ms,
            released: false,
        };
        if !self.append(&dir, next, &lease)? {
            return Ok(false);
        }

        // A stale scan can land in a slot that was already pruned below a newer record.
        // Only the highest record counts.
        if latest_generation(&dir)? != Some(next) {
            let _ = fs::remove_file(record_path(&dir, next));
            return Ok(false);
        }
        self.prune(&dir, next);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), LeaseError> {
        let dir = self.key_dir(key);
        let Some(current) = self.current(key, &dir)? else {
            return Ok(());
        };
        if current.live().is_none() {
            return Ok(());
        }
        let next = current.generation + 1;
        if self.append(&dir, next, &Self::release_record(&current, key))? {
            self.prune(&dir, next);
        }
        Ok(())
    }

    async fn release_owned(&self, key: &str, owner: &str) -> Result<bool, LeaseError> {
        let dir = self.key_dir(key);
        let Some(current) = self.current(key, &dir)? else {
            return Ok(false);
        };
        if current.live().map(|lease| lease.owner.as_str()) != Some(owner) {
            return Ok(false);
        }
        let next = current.generation + 1;
        let released = self.append(&dir, next, &Self::release_record(&current, key))?;
        if released {
            self.prune(&dir, next);
        }
        Ok(released)
    }

    async fn holder(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let dir = self.key_dir(key);
        let current = self.current(key, &dir)?;
        Ok(current
            .as_ref()
            .and_then(Current::live)
            .map(|lease| LeaseRecord {
                owner: lease.owner.clone(),
                expires_at_ms: lease.expires_at_ms,
            }))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

fn record_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:020}{}", generation, RECORD_SUFFIX))
}

fn parse_generation(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(RECORD_SUFFIX)?.parse().ok()
}

fn latest_generation(dir: &Path) -> Result<Option<u64>, LeaseError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut latest = None;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        if let Some(generation) = parse_generation(&entry.file_name().to_string_lossy()) {
            latest = latest.max(Some(generation));
        }
    }
    Ok(latest)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn io_error(path: &Path, err: io::Error) -> LeaseError {
    LeaseError::Unavailable(format!("{}: {}", path.display(), err))
}
