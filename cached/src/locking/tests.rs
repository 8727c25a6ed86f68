use std::time::Duration;

use super::*;

#[tokio::test]
async fn test_try_lock_mutual_exclusion() {
    let locker = LocalLocker::new();

    let first = locker
        .try_lock("download:nar:abc", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = locker
        .try_lock("download:nar:abc", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(second.is_none());

    locker.unlock(first.unwrap()).await.unwrap();

    let third = locker
        .try_lock("download:nar:abc", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(third.is_some());
}

#[tokio::test]
async fn test_expired_lease_reclaimed() {
    let locker = LocalLocker::new();

    let guard = locker
        .try_lock("lru", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The original guard is never explicitly unlocked: the lease
    // expiring on its own must let a new holder in.
    drop(guard);

    let reacquired = locker
        .try_lock("lru", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(reacquired.is_some());
}

#[tokio::test]
async fn test_rlock_allows_concurrent_readers() {
    let locker = LocalLocker::new();

    let r1 = locker.rlock("cache", Duration::from_secs(5)).await.unwrap();
    let r2 = locker.rlock("cache", Duration::from_secs(5)).await.unwrap();

    locker.runlock(r1).await.unwrap();
    locker.runlock(r2).await.unwrap();
}
