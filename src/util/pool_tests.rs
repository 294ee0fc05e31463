//! Worker pool tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::WorkerPool;

#[test]
fn test_pool_runs_all_jobs() {
    let pool = WorkerPool::new(4);
    let (tx, rx) = mpsc::channel();
    for i in 0..64usize {
        let tx = tx.clone();
        pool.submit(move || tx.send(i).unwrap());
    }
    drop(tx);

    let mut seen = 0usize;
    while rx.recv_timeout(Duration::from_secs(5)).is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 64);
}

#[test]
fn test_pool_drains_queue_on_drop() {
    let count = Arc::new(AtomicUsize::new(0));
    {
        let pool = WorkerPool::new(1);
        for _ in 0..16 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        // Drop stops intake, then joins; queued jobs still run.
    }
    assert_eq!(count.load(Ordering::Relaxed), 16);
}

#[test]
fn test_submit_after_shutdown_is_discarded() {
    let pool = WorkerPool::new(1);
    pool.shutdown();
    let count = Arc::new(AtomicUsize::new(0));
    let job_count = Arc::clone(&count);
    pool.submit(move || {
        job_count.fetch_add(1, Ordering::Relaxed);
    });
    drop(pool);
    assert_eq!(count.load(Ordering::Relaxed), 0);
}
