//! Periodic task lifecycle tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::PeriodicTask;

#[test]
fn test_periodic_runs_repeatedly() {
    let count = Arc::new(AtomicUsize::new(0));
    let task_count = Arc::clone(&count);
    let task = PeriodicTask::spawn("test-periodic", Duration::from_millis(10), move || {
        task_count.fetch_add(1, Ordering::Relaxed);
    });

    thread::sleep(Duration::from_millis(100));
    drop(task);

    assert!(count.load(Ordering::Relaxed) >= 3, "task should have ticked");
}

#[test]
fn test_stop_observed_within_one_period() {
    let count = Arc::new(AtomicUsize::new(0));
    let task_count = Arc::clone(&count);
    let task = PeriodicTask::spawn("test-slow", Duration::from_secs(60), move || {
        task_count.fetch_add(1, Ordering::Relaxed);
    });

    // Dropping (stop + join) must not wait for the 60 s period to elapse.
    let start = Instant::now();
    drop(task);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(count.load(Ordering::Relaxed), 0);
}
