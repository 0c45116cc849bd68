//! Worker pool scenarios exercised through the runtime surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use vigil_runtime::{PoolConfig, Runtime, RuntimeConfig, RuntimeError, WorkerPool};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_backpressure_is_exact_and_recovers() {
    init_logging();
    let pool = WorkerPool::new(PoolConfig {
        max_threads: 1,
        max_tasks: 3,
        idle_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
    });

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    pool.submit("gate", move || {
        started_tx.send(()).unwrap();
        release_rx.recv().ok();
    })
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Exactly max_tasks submissions fit; the next one is refused.
    for i in 1..=3 {
        assert_eq!(pool.submit("fill", || {}).unwrap(), i);
    }
    assert!(matches!(
        pool.submit("overflow", || {}),
        Err(RuntimeError::QueueFull { depth: 3 })
    ));

    release_tx.send(()).unwrap();
    assert!(!pool.wait(Duration::from_secs(2)), "queue never drained");
    assert_eq!(pool.submit("after-drain", || {}).unwrap(), 1);
    pool.stop();
}

#[test]
fn test_pool_wait_reports_pending_work() {
    init_logging();
    let runtime = Runtime::new(RuntimeConfig {
        pool: PoolConfig {
            max_threads: 1,
            ..PoolConfig::default()
        },
        ..RuntimeConfig::default()
    })
    .expect("Failed to create runtime");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    runtime
        .submit_task("slow", move || {
            release_rx.recv().ok();
        })
        .unwrap();

    // Still pending while the task blocks, drained shortly after release.
    assert!(runtime.pool_wait(Duration::from_millis(100)));
    release_tx.send(()).unwrap();
    assert!(!runtime.pool_wait(Duration::from_secs(2)));
}

#[test]
fn test_burst_submissions_all_execute() {
    init_logging();
    let pool = WorkerPool::new(PoolConfig {
        max_threads: 4,
        max_tasks: 0,
        idle_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
    });

    let executed = Arc::new(AtomicUsize::new(0));
    let mut submitters = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let executed = Arc::clone(&executed);
        submitters.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let executed = Arc::clone(&executed);
                pool.submit("burst", move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }));
    }
    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert!(!pool.wait(Duration::from_secs(5)), "burst never drained");
    assert_eq!(executed.load(Ordering::SeqCst), 200);

    // The pool never grew past its ceiling.
    assert!(pool.active_workers() <= 4);
    pool.stop();
}

#[test]
fn test_stop_with_stuck_worker_returns_within_bound() {
    init_logging();
    let pool = WorkerPool::new(PoolConfig {
        max_threads: 1,
        max_tasks: 0,
        idle_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    });

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    pool.submit("stuck", move || {
        started_tx.send(()).unwrap();
        release_rx.recv().ok();
    })
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let begun = Instant::now();
    pool.stop();
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.active_workers(), 1);

    release_tx.send(()).unwrap();
}
