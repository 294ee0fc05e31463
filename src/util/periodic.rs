//! Cancellation-aware periodic task.
//!
//! The worker thread runs `task` once per period inside a timed condvar
//! wait, so a stop request is observed within one period even while the
//! thread is sleeping.  Dropping the handle stops and joins the thread.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Shared {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Handle to a thread that runs a task at a fixed period until stopped.
pub struct PeriodicTask {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a named thread running `task` every `period`.
    ///
    /// The first run happens one full period after the spawn.
    pub fn spawn<F>(name: &str, period: Duration, mut task: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let guard = worker_shared.stopped.lock().unwrap();
                let (guard, timeout) = worker_shared
                    .cv
                    .wait_timeout_while(guard, period, |stopped| !*stopped)
                    .unwrap();
                if *guard {
                    break;
                }
                drop(guard);
                if timeout.timed_out() {
                    task();
                }
            })
            .expect("failed to spawn periodic thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Request the task to stop.  The worker observes this within one period.
    pub fn stop(&self) {
        let mut stopped = self.shared.stopped.lock().unwrap();
        *stopped = true;
        self.shared.cv.notify_all();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
