//! Integration tests for the pooled connection manager: capacity bounds,
//! FIFO waiting, re-entrancy, release semantics, and shutdown.

use scopedb::conn::ConnectionManager;
use scopedb::error::DbError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn file_url(dir: &TempDir, capacity: Option<u32>) -> String {
    let path = dir.path().join("app.db");
    match capacity {
        Some(n) => format!("sqlite+pool:{}?max_connections={}", path.display(), n),
        None => format!("sqlite:{}", path.display()),
    }
}

/// Poll a condition until it holds or the deadline passes.
async fn wait_for(mut check: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_capacity_bound_and_fifo_grant() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::from_url(&file_url(&dir, Some(2))).unwrap());

    let a = manager.scope();
    let b = manager.scope();
    manager.acquire(a.id()).await.unwrap();
    manager.acquire(b.id()).await.unwrap();
    assert_eq!(manager.in_use(), 2);

    // Third concurrent acquisition suspends instead of exceeding capacity.
    let mgr = Arc::clone(&manager);
    let c_task = tokio::spawn(async move {
        let c = mgr.scope();
        mgr.acquire(c.id()).await.unwrap();
        let granted = mgr.in_use();
        mgr.release(c.id()).await.unwrap();
        granted
    });

    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 1).await;
    }
    assert_eq!(manager.in_use(), 2);

    // Releasing A grants C immediately; in_use never exceeded capacity.
    manager.release(a.id()).await.unwrap();
    let in_use_at_grant = timeout(Duration::from_secs(5), c_task)
        .await
        .unwrap()
        .unwrap();
    assert!(in_use_at_grant <= 2);

    manager.release(b.id()).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_waiters_served_in_arrival_order() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::from_url(&file_url(&dir, Some(1))).unwrap());

    let holder = manager.scope();
    manager.acquire(holder.id()).await.unwrap();

    let (first_tx, first_rx) = tokio::sync::oneshot::channel::<()>();
    let mgr = Arc::clone(&manager);
    let first = tokio::spawn(async move {
        let scope = mgr.scope();
        mgr.acquire(scope.id()).await.unwrap();
        let _ = first_tx.send(());
        sleep(Duration::from_millis(50)).await;
        mgr.release(scope.id()).await.unwrap();
    });

    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 1).await;
    }

    let mgr = Arc::clone(&manager);
    let second = tokio::spawn(async move {
        let scope = mgr.scope();
        mgr.acquire(scope.id()).await.unwrap();
        mgr.release(scope.id()).await.unwrap();
    });

    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 2).await;
    }

    manager.release(holder.id()).await.unwrap();

    // The earlier waiter is granted the slot first.
    timeout(Duration::from_secs(5), first_rx)
        .await
        .expect("first waiter was not granted before the test deadline")
        .unwrap();

    first.await.unwrap();
    second.await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_reentrant_acquire_shares_one_connection() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::from_url(&file_url(&dir, Some(2))).unwrap();

    let scope = manager.scope();
    manager.acquire(scope.id()).await.unwrap();
    manager.acquire(scope.id()).await.unwrap();
    manager.acquire(scope.id()).await.unwrap();

    assert_eq!(manager.depth(scope.id()).await, 3);
    assert_eq!(manager.in_use(), 1);

    manager.release(scope.id()).await.unwrap();
    manager.release(scope.id()).await.unwrap();
    assert_eq!(manager.depth(scope.id()).await, 1);
    assert!(manager.is_open(scope.id()).await);

    manager.release(scope.id()).await.unwrap();
    assert_eq!(manager.depth(scope.id()).await, 0);
    assert!(!manager.is_open(scope.id()).await);
    assert_eq!(manager.in_use(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_clean_release_commits() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::from_url(&file_url(&dir, None)).unwrap();

    let writer = manager.scope();
    manager.acquire(writer.id()).await.unwrap();
    manager
        .execute(writer.id(), "CREATE TABLE t (name TEXT)")
        .await
        .unwrap();
    manager
        .execute(writer.id(), "INSERT INTO t (name) VALUES ('kept')")
        .await
        .unwrap();
    manager.release(writer.id()).await.unwrap();

    let reader = manager.scope();
    manager.acquire(reader.id()).await.unwrap();
    let names = manager
        .fetch_strings(reader.id(), "SELECT name FROM t")
        .await
        .unwrap();
    assert_eq!(names, vec!["kept"]);
    manager.release(reader.id()).await.unwrap();

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_scope_rolls_back() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::from_url(&file_url(&dir, None)).unwrap();

    let setup = manager.scope();
    manager.acquire(setup.id()).await.unwrap();
    manager
        .execute(setup.id(), "CREATE TABLE t (name TEXT)")
        .await
        .unwrap();
    manager.release(setup.id()).await.unwrap();

    let scope = manager.scope();
    let result: Result<(), DbError> = manager
        .scoped(scope.id(), || async {
            manager
                .execute(scope.id(), "INSERT INTO t (name) VALUES ('discarded')")
                .await?;
            Err(DbError::internal("handler failed"))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(manager.depth(scope.id()).await, 0);

    let reader = manager.scope();
    manager.acquire(reader.id()).await.unwrap();
    let names = manager
        .fetch_strings(reader.id(), "SELECT name FROM t")
        .await
        .unwrap();
    assert!(names.is_empty());
    manager.release(reader.id()).await.unwrap();

    manager.shutdown().await;
}

#[tokio::test]
async fn test_in_memory_pool_shares_one_connection() {
    let manager =
        ConnectionManager::from_url("sqlite+pool::memory:?max_connections=5").unwrap();
    assert_eq!(manager.capacity(), Some(5));

    // Independent in-memory databases per slot would not see each other's
    // tables; a shared connection does.
    let a = manager.scope();
    manager.acquire(a.id()).await.unwrap();
    manager
        .execute(a.id(), "CREATE TABLE shared (name TEXT)")
        .await
        .unwrap();
    manager.release(a.id()).await.unwrap();

    let b = manager.scope();
    manager.acquire(b.id()).await.unwrap();
    manager
        .execute(b.id(), "INSERT INTO shared (name) VALUES ('visible')")
        .await
        .unwrap();
    let names = manager
        .fetch_strings(b.id(), "SELECT name FROM shared")
        .await
        .unwrap();
    assert_eq!(names, vec!["visible"]);
    manager.release(b.id()).await.unwrap();

    // The shared connection never consumes pool permits.
    assert_eq!(manager.in_use(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_queue_intact() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::from_url(&file_url(&dir, Some(1))).unwrap());

    let holder = manager.scope();
    manager.acquire(holder.id()).await.unwrap();

    let mgr = Arc::clone(&manager);
    let abandoned = tokio::spawn(async move {
        let scope = mgr.scope();
        mgr.acquire(scope.id()).await
    });
    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 1).await;
    }

    abandoned.abort();
    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 0).await;
    }

    // The slot freed by the holder still reaches a later acquirer.
    manager.release(holder.id()).await.unwrap();
    let late = manager.scope();
    timeout(Duration::from_secs(5), manager.acquire(late.id()))
        .await
        .expect("slot was lost to the cancelled waiter")
        .unwrap();
    manager.release(late.id()).await.unwrap();

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_queued_waiters() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::from_url(&file_url(&dir, Some(1))).unwrap());

    let holder = manager.scope();
    manager.acquire(holder.id()).await.unwrap();

    let mgr = Arc::clone(&manager);
    let waiter = tokio::spawn(async move {
        let scope = mgr.scope();
        mgr.acquire(scope.id()).await
    });
    {
        let m = Arc::clone(&manager);
        wait_for(move || m.waiter_count() == 1).await;
    }

    manager.shutdown().await;

    let outcome = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(DbError::PoolClosed)));
    assert!(matches!(
        manager.acquire(holder.id()).await,
        Err(DbError::PoolClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_use_never_exceeds_capacity_under_load() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::from_url(&file_url(&dir, Some(2))).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let mgr = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let scope = mgr.scope();
            for _ in 0..5 {
                mgr.acquire(scope.id()).await.unwrap();
                assert!(mgr.in_use() <= 2);
                sleep(Duration::from_millis(2)).await;
                mgr.release(scope.id()).await.unwrap();
            }
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }

    assert_eq!(manager.in_use(), 0);
    assert_eq!(manager.waiter_count(), 0);
    manager.shutdown().await;
}
