#[path = "../support/mod.rs"]
mod support;

use flowrun::core::sandbox::{BoxState, SandboxCommand, SandboxLimits, SandboxStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{pool, ScriptedBackend, RUNTIME};
use tempfile::TempDir;

#[tokio::test]
async fn exhausted_pool_waits_for_a_release() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let pool = pool(&backend, 1);

    let held = pool.checkout().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.checkout().await.map(|lease| lease.id()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.available(), 0);

    held.release();
    let id = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should get the released box")
        .unwrap()
        .unwrap();
    assert_eq!(id, 0);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn full_pool_of_twenty_hands_the_next_release_to_the_waiter() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let pool = pool(&backend, 20);

    let mut held = Vec::new();
    for _ in 0..20 {
        held.push(pool.checkout().await.unwrap());
    }
    let mut ids: Vec<usize> = held.iter().map(|lease| lease.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
    assert_eq!(pool.available(), 0);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let lease = pool.checkout().await.unwrap();
            let leftover = lease.scratch_dir().join("leftover.txt").exists();
            (lease.id(), leftover)
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(backend.inits.load(Ordering::SeqCst), 20);

    let released = held.remove(7);
    let released_id = released.id();
    std::fs::write(released.scratch_dir().join("leftover.txt"), "run 7").unwrap();
    drop(released);

    let (id, leftover) = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should get the released box")
        .unwrap();
    assert_eq!(id, released_id);
    assert!(!leftover);
    assert_eq!(backend.inits.load(Ordering::SeqCst), 21);
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 21);
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.stats().checkouts, 21);
}

#[tokio::test]
async fn checkout_wipes_what_the_previous_holder_left() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let pool = pool(&backend, 1);

    let lease = pool.checkout().await.unwrap();
    let leftover = lease.scratch_dir().join("secret.txt");
    std::fs::write(&leftover, "previous run").unwrap();
    assert_eq!(pool.snapshot()[0].state, BoxState::Busy);
    drop(lease);
    assert_eq!(pool.snapshot()[0].state, BoxState::Free);

    let lease = pool.checkout().await.unwrap();
    assert!(lease.scratch_dir().is_dir());
    assert!(!leftover.exists());
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(backend.inits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_holders_never_exceed_pool_size() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    backend.set_run_delay(Duration::from_millis(20));
    let pool = pool(&backend, 3);

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let lease = pool.checkout().await.unwrap();
            std::fs::write(lease.scratch_dir().join("index.js"), "exports.code = async (i) => i // echo")
                .unwrap();
            std::fs::write(lease.scratch_dir().join("input.json"), "{}").unwrap();
            pool.execute(&lease, &SandboxCommand::new(RUNTIME, SandboxLimits::default()))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_success());
    }

    assert!(backend.peak_in_flight.load(Ordering::SeqCst) <= 3);
    assert_eq!(backend.finished.load(Ordering::SeqCst), 12);
    let stats = pool.stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.checkouts, 12);
    assert_eq!(stats.releases, 12);
}

#[tokio::test]
async fn dropping_an_execution_releases_the_box() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    backend.set_run_delay(Duration::from_secs(30));
    let pool = pool(&backend, 1);

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let lease = pool.checkout().await.unwrap();
            pool.execute(&lease, &SandboxCommand::new(RUNTIME, SandboxLimits::default()))
                .await
        })
    };
    while backend.started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    let _ = task.await;

    assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);
    let lease = tokio::time::timeout(Duration::from_secs(1), pool.checkout())
        .await
        .expect("box should be free again")
        .unwrap();
    assert_eq!(lease.id(), 0);
}

#[tokio::test]
async fn backend_overrunning_its_budget_is_timed_out() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    backend.set_run_delay(Duration::from_secs(30));
    let pool = pool(&backend, 1);

    let lease = pool.checkout().await.unwrap();
    let limits = SandboxLimits::default().with_wall_time(Duration::from_millis(100));
    let outcome = pool
        .execute(&lease, &SandboxCommand::new(RUNTIME, limits))
        .await
        .unwrap();

    assert_eq!(outcome.status, SandboxStatus::TimedOut);
    assert!(!outcome.is_success());
    assert!(outcome.stderr.contains("wall time limit of 100ms exceeded"));
}

#[tokio::test]
async fn unknown_commands_report_runtime_errors() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let pool = pool(&backend, 1);

    let lease = pool.checkout().await.unwrap();
    let outcome = pool
        .execute(&lease, &SandboxCommand::new("make all", SandboxLimits::default()))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(127));
    assert_eq!(outcome.log(), "make all: command not found");
}
