// Integration tests for the distributed lock
// Several participants with separate application ids share one store

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stratus_coordination::{AcquireOptions, LockContext, StratusError};
use stratus_integration_tests::{participant, shared_store};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_across_participants() {
    let store = shared_store(1);
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let coordinator = participant(&store);
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tokio::spawn(async move {
                let locks = coordinator.lock_manager();
                for _ in 0..4 {
                    let handle = locks
                        .acquire("shared/resource", LockContext::Application, Duration::from_secs(10))
                        .await
                        .unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.release(&handle).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(store.active_leases(), 0);
}

#[tokio::test]
async fn test_release_then_acquire() {
    let store = shared_store(0);
    let a = participant(&store);
    let b = participant(&store);

    let handle = a
        .lock_manager()
        .acquire("job", LockContext::Instance, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(
        b.lock_manager()
            .try_acquire("job", LockContext::Instance)
            .await
            .unwrap()
            .is_none()
    );

    a.lock_manager().release(&handle).await.unwrap();
    // Releasing twice is a no-op.
    a.lock_manager().release(&handle).await.unwrap();

    let taken = b
        .lock_manager()
        .try_acquire("job", LockContext::Instance)
        .await
        .unwrap();
    assert!(taken.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_while_held() {
    let store = shared_store(0);
    let a = participant(&store);
    let b = participant(&store);

    let _held = a
        .lock_manager()
        .acquire("job", LockContext::Application, Duration::from_secs(1))
        .await
        .unwrap();
    let result = b
        .lock_manager()
        .acquire("job", LockContext::Application, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(StratusError::LockTimeout { .. })));
    assert_eq!(b.lock_manager().stats().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_holder_loses_the_lock() {
    let store = shared_store(0);
    let a = participant(&store);
    let b = participant(&store);

    let stale = a
        .lock_manager()
        .acquire_with(
            "job",
            LockContext::Application,
            AcquireOptions::new().lease(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;

    let fresh = b
        .lock_manager()
        .acquire("job", LockContext::Application, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(
        a.lock_manager().renew(&stale, Duration::from_secs(5)).await,
        Err(StratusError::NotHolder { .. })
    ));
    // The stale handle is already released locally, so this is a no-op.
    a.lock_manager().release(&stale).await.unwrap();
    assert!(fresh.is_valid());
    assert!(b.lock_manager().is_locked("job").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_lease_longer_than_store_maximum_is_kept_alive() {
    let store = shared_store(0);
    let a = participant(&store);
    let b = participant(&store);

    let handle = a
        .lock_manager()
        .acquire_with(
            "long-job",
            LockContext::Application,
            AcquireOptions::new().lease(Duration::from_secs(300)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(
        b.lock_manager()
            .try_acquire("long-job", LockContext::Application)
            .await
            .unwrap()
            .is_none()
    );

    a.lock_manager().release(&handle).await.unwrap();
    assert!(
        b.lock_manager()
            .try_acquire("long-job", LockContext::Application)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_leaves_no_lease() {
    let store = shared_store(0);
    let a = participant(&store);
    let b = participant(&store);

    let held = a
        .lock_manager()
        .acquire("job", LockContext::Application, Duration::from_secs(1))
        .await
        .unwrap();

    let cancel = stratus_coordination::CancellationToken::new();
    let waiter = {
        let locks = b.lock_manager().clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            locks
                .acquire_with(
                    "job",
                    LockContext::Application,
                    AcquireOptions::new()
                        .timeout(Duration::from_secs(60))
                        .cancel(cancel),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(StratusError::Cancelled)
    ));

    a.lock_manager().release(&held).await.unwrap();
    assert_eq!(store.active_leases(), 0);
}
