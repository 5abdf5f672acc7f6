//! Cross-replica lease behaviour over stores opened independently on one directory

use futures::future::join_all;
use sitesmith::config::{LeaseConfig, LeaseStoreKind};
use sitesmith::lease::{FileLeaseStore, LeaseBackend, LeaseLock, LeaseStore, SledLeaseStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One replica: its own store handle on the shared lease directory.
fn replica(dir: &Path, name: &str) -> LeaseLock {
    let store = FileLeaseStore::open(dir).unwrap();
    LeaseLock::with_shared_store(Arc::new(store), name)
}

fn configured_replica(dir: &Path, name: &str) -> LeaseLock {
    LeaseLock::from_config(&LeaseConfig {
        store_path: Some(dir.to_path_buf()),
        instance_id: Some(name.to_string()),
        ..LeaseConfig::default()
    })
}

#[tokio::test]
async fn replicas_configured_with_one_path_exclude_each_other() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let a = configured_replica(&leases, "replica-a");
    let b = configured_replica(&leases, "replica-b");

    assert!(a.has_shared_store());
    assert!(b.has_shared_store());

    let first = a.acquire_default("event:t:c:e0").await;
    let second = b.acquire_default("event:t:c:e0").await;

    assert!(first.acquired);
    assert!(!second.acquired);
    assert_eq!(second.backend, LeaseBackend::Shared);
    assert_eq!(
        b.holder("event:t:c:e0").await.map(|record| record.owner),
        Some(first.owner)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_replica_wins_a_race() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let replicas: Vec<Arc<LeaseLock>> = (0..8)
        .map(|i| Arc::new(replica(&leases, &format!("replica-{}", i))))
        .collect();

    let handles: Vec<_> = replicas
        .iter()
        .map(|lock| {
            let lock = Arc::clone(lock);
            tokio::spawn(async move { lock.acquire("event:t:c:e1", Duration::from_secs(30)).await })
        })
        .collect();
    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = outcomes.iter().filter(|outcome| outcome.acquired).collect();
    assert_eq!(winners.len(), 1);
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.backend == LeaseBackend::Shared));

    let observer = FileLeaseStore::open(&leases).unwrap();
    let holder = observer.holder("event:t:c:e1").await.unwrap().unwrap();
    assert_eq!(holder.owner, winners[0].owner);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_an_expired_lease_has_one_winner() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let stalled = replica(&leases, "replica-stalled");
    assert!(
        stalled
            .acquire("event:t:c:e5", Duration::from_millis(20))
            .await
            .acquired
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let lock = replica(&leases, &format!("replica-{}", i));
            tokio::spawn(async move { lock.acquire("event:t:c:e5", Duration::from_secs(30)).await })
        })
        .collect();
    let winners = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| joined.as_ref().unwrap().acquired)
        .count();

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let stalled = replica(&leases, "replica-a");
    let healthy = replica(&leases, "replica-b");

    assert!(
        stalled
            .acquire("event:t:c:e2", Duration::from_millis(20))
            .await
            .acquired
    );
    assert!(
        !healthy
            .acquire("event:t:c:e2", Duration::from_secs(30))
            .await
            .acquired
    );

    tokio::time::sleep(Duration::from_millis(60)).await;

    let takeover = healthy
        .acquire("event:t:c:e2", Duration::from_secs(30))
        .await;
    assert!(takeover.acquired);
    assert_eq!(
        healthy.holder("event:t:c:e2").await.map(|record| record.owner),
        Some(takeover.owner)
    );
}

#[tokio::test]
async fn stalled_holder_cannot_release_a_takeover() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let stalled = replica(&leases, "replica-a");
    let healthy = replica(&leases, "replica-b");

    let stale = stalled
        .acquire("event:t:c:e6", Duration::from_millis(20))
        .await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let takeover = healthy.acquire_default("event:t:c:e6").await;
    assert!(takeover.acquired);

    stalled.release_owned("event:t:c:e6", &stale.owner).await;

    assert_eq!(
        healthy.holder("event:t:c:e6").await.map(|record| record.owner),
        Some(takeover.owner.clone())
    );
    healthy.release_owned("event:t:c:e6", &takeover.owner).await;
    assert!(healthy.holder("event:t:c:e6").await.is_none());
}

#[tokio::test]
async fn release_frees_the_key_for_other_replicas() {
    let temp_dir = TempDir::new().unwrap();
    let leases = temp_dir.path().join("leases");
    let first = replica(&leases, "replica-a");
    let second = replica(&leases, "replica-b");

    assert!(first.acquire_default("event:t:c:e3").await.acquired);
    first.release("event:t:c:e3").await;

    assert!(second.acquire_default("event:t:c:e3").await.acquired);
    assert!(!first.acquire_default("event:t:c:e3").await.acquired);
}

#[tokio::test]
async fn local_only_locks_do_not_exclude_each_other() {
    let a = LeaseLock::local_only("replica-a");
    let b = LeaseLock::local_only("replica-b");

    let first = a.acquire_default("event:t:c:e4").await;
    let second = b.acquire_default("event:t:c:e4").await;

    assert!(first.acquired);
    assert!(second.acquired);
    assert_eq!(first.backend, LeaseBackend::Local);
    assert!(!a.acquire_default("event:t:c:e4").await.acquired);
}

#[tokio::test]
async fn sled_store_is_shared_by_workers_of_one_process() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledLeaseStore::open(temp_dir.path().join("leases.sled")).unwrap());
    let a = LeaseLock::with_shared_store(store.clone(), "worker-a");
    let b = LeaseLock::with_shared_store(store.clone(), "worker-b");

    assert!(a.acquire_default("event:t:c:e7").await.acquired);
    assert!(!b.acquire_default("event:t:c:e7").await.acquired);
}

#[test]
fn second_process_cannot_open_a_sled_store() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("leases.sled");
    let config = |name: &str| LeaseConfig {
        store: LeaseStoreKind::Sled,
        store_path: Some(path.clone()),
        instance_id: Some(name.to_string()),
        ..LeaseConfig::default()
    };

    let first = LeaseLock::from_config(&config("replica-a"));
    let second = LeaseLock::from_config(&config("replica-b"));

    assert!(first.has_shared_store());
    assert!(!second.has_shared_store());
}
