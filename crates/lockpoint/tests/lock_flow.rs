//! End-to-end lock behavior across clients sharing one store.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use lockpoint::Fairness;
use lockpoint::LockClient;
use lockpoint::LockClientConfig;
use lockpoint::LockError;
use lockpoint_testing::DeterministicLockStore;
use tokio::time::Instant;

fn client(store: &Arc<DeterministicLockStore>, id: &str) -> LockClient {
    LockClient::new(
        Arc::clone(store),
        LockClientConfig {
            key_prefix: "lp".to_string(),
            client_id: Some(id.to_string()),
            ..LockClientConfig::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_write_lock_mutual_exclusion() {
    let store = DeterministicLockStore::new();
    let mut held = client(&store, "a").write_lock("jobs", Fairness::Unfair);
    let mut contender = client(&store, "b").write_lock("jobs", Fairness::Unfair);

    held.lock().await.unwrap();
    assert!(held.is_locked());

    assert!(!contender.try_lock().await.unwrap());
    assert!(!contender
        .try_lock_for(Duration::from_millis(200))
        .await
        .unwrap());
    assert!(!contender.is_locked());

    held.unlock().await.unwrap();
    assert!(contender.try_lock().await.unwrap());
    assert!(contender.is_locked() && !held.is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_readers_share_while_writers_are_excluded() {
    let store = DeterministicLockStore::new();
    let mut first = client(&store, "a").read_lock("jobs", Fairness::Unfair);
    let mut second = client(&store, "b").read_lock("jobs", Fairness::Unfair);
    let mut writer = client(&store, "c").write_lock("jobs", Fairness::Unfair);

    first.lock().await.unwrap();
    second.lock().await.unwrap();
    assert!(first.is_locked() && second.is_locked());
    assert_eq!(store.value("lp:lockcount:jobs").as_deref(), Some("2"));

    assert!(!writer.try_lock().await.unwrap());

    // The non-owner releases first so the owner's release drains the point.
    second.unlock().await.unwrap();
    first.unlock().await.unwrap();
    assert!(store.keyspace_empty("lp", "jobs"));

    assert!(writer.try_lock().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_release_wakes_unfair_waiter_promptly() {
    let store = DeterministicLockStore::new();
    let mut held = client(&store, "a").write_lock("jobs", Fairness::Unfair);
    let mut waiter = client(&store, "b").write_lock("jobs", Fairness::Unfair);

    held.lock().await.unwrap();
    let started = Instant::now();
    let waiting = tokio::spawn(async move {
        waiter.lock().await.unwrap();
        (waiter, Instant::now())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    held.unlock().await.unwrap();

    let (mut waiter, granted_at) = waiting.await.unwrap();
    // Far sooner than the 30s default lease the bounded wait would allow.
    assert!(granted_at - started < Duration::from_millis(100));
    waiter.unlock().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fair_waiters_are_granted_in_fifo_order() {
    let store = DeterministicLockStore::new();
    let mut held = client(&store, "holder").write_lock("jobs", Fairness::Fair);
    held.lock().await.unwrap();

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for index in 0..3u32 {
        let mut handle =
            client(&store, &format!("w{index}")).write_lock("jobs", Fairness::Fair);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            handle.lock().await.unwrap();
            order.lock().unwrap().push(index);
            handle.unlock().await.unwrap();
        }));
        // Give each waiter time to enqueue before the next arrives.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    held.unlock().await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_recovers_after_lease_expiry() {
    let store = DeterministicLockStore::new();
    let mut crashed = client(&store, "a").write_lock("jobs", Fairness::Unfair);
    let mut waiter = client(&store, "b").write_lock("jobs", Fairness::Unfair);

    crashed
        .lock_with_lease(Duration::from_millis(1_000))
        .await
        .unwrap();

    // The holder never unlocks; the waiter must get through once the
    // lease expires, without any notification being delivered.
    let started = Instant::now();
    waiter.lock().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_millis(1_200));
    waiter.unlock().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_fair_writer_blocks_new_readers() {
    let store = DeterministicLockStore::new();
    let mut reader = client(&store, "r1").read_lock("jobs", Fairness::Unfair);
    let mut writer = client(&store, "w").write_lock("jobs", Fairness::Fair);
    let mut late_reader = client(&store, "r2").read_lock("jobs", Fairness::Unfair);

    reader.lock().await.unwrap();
    let writing = tokio::spawn(async move {
        writer.lock().await.unwrap();
        let locked_at = Instant::now();
        writer.unlock().await.unwrap();
        locked_at
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The point is draining for the queued writer; new readers stay out.
    assert_eq!(store.value("lp:lockpoint:jobs").as_deref(), Some("closed"));
    assert!(!late_reader.try_lock().await.unwrap());

    reader.unlock().await.unwrap();
    writing.await.unwrap();

    late_reader.lock().await.unwrap();
    late_reader.unlock().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shared_batch_is_granted_concurrently() {
    let store = DeterministicLockStore::new();
    let mut held = client(&store, "w").write_lock("jobs", Fairness::Fair);
    held.lock().await.unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let mut readers = Vec::new();
    for index in 0..2u32 {
        let mut handle =
            client(&store, &format!("r{index}")).read_lock("jobs", Fairness::Fair);
        let barrier = Arc::clone(&barrier);
        readers.push(tokio::spawn(async move {
            handle.lock().await.unwrap();
            // Both readers hold the lock at the same time or this hangs.
            barrier.wait().await;
            handle.unlock().await.unwrap();
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    held.unlock().await.unwrap();
    for reader in readers {
        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("shared batch was not granted concurrently")
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retracts_fair_queue_entry() {
    let store = DeterministicLockStore::new();
    let mut held = client(&store, "a").write_lock("jobs", Fairness::Unfair);
    let mut waiter = client(&store, "b").write_lock("jobs", Fairness::Fair);

    held.lock().await.unwrap();
    assert!(!waiter
        .try_lock_for(Duration::from_millis(200))
        .await
        .unwrap());

    // The abandoned waiter retracts its queue entry best-effort.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.list("lp:lockwait:jobs").is_empty());
    assert!(store.set_members("lp:lockpool:jobs").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unlock_is_idempotent_and_double_lock_errors() {
    let store = DeterministicLockStore::new();
    let mut handle = client(&store, "a").write_lock("jobs", Fairness::Unfair);

    handle.unlock().await.unwrap();
    handle.lock().await.unwrap();

    let error = handle.lock().await.unwrap_err();
    assert!(matches!(error, LockError::AlreadyHeld { .. }));
    assert!(handle.is_locked());

    handle.unlock().await.unwrap();
    handle.unlock().await.unwrap();
    assert!(!handle.is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_lease_overrides_and_default_lease_setter() {
    let store = DeterministicLockStore::new();
    let owner = client(&store, "a");
    assert_eq!(owner.default_lease(), Duration::from_secs(30));

    owner.set_default_lease(Duration::from_secs(5));
    assert_eq!(owner.default_lease(), Duration::from_secs(5));

    let mut handle = owner.write_lock("jobs", Fairness::Unfair);
    handle.lock().await.unwrap();
    let ttl = store.remaining_ttl("lp:lockpoint:jobs").unwrap();
    assert!(ttl <= Duration::from_secs(5) && ttl > Duration::from_secs(4));
    handle.unlock().await.unwrap();

    handle
        .lock_with_lease(Duration::from_secs(2))
        .await
        .unwrap();
    let ttl = store.remaining_ttl("lp:lockpoint:jobs").unwrap();
    assert!(ttl <= Duration::from_secs(2) && ttl > Duration::from_secs(1));
    handle.unlock().await.unwrap();

    assert!(store.keyspace_empty("lp", "jobs"));
}

#[tokio::test(start_paused = true)]
async fn test_rwlock_pair_shares_one_lockpoint() {
    let store = DeterministicLockStore::new();
    let owner = client(&store, "a");
    let mut pair = owner.rwlock("jobs", Fairness::Unfair);

    pair.read().lock().await.unwrap();
    assert!(!pair.write().try_lock().await.unwrap());
    pair.read().unlock().await.unwrap();

    pair.write().lock().await.unwrap();
    assert!(pair.write().is_locked());
    pair.write().unlock().await.unwrap();
    assert!(store.keyspace_empty("lp", "jobs"));
}
