//! Fixed-size worker pool for inbound datagram handling.
//!
//! Handlers are short and never block on network I/O, so a small pool (the
//! node uses 8 threads) keeps dispatch latency bounded.  Shutdown wakes
//! every worker; queued jobs submitted before the stop are still drained.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: Mutex<QueueInner>,
    cv: Condvar,
}

struct QueueInner {
    pending: VecDeque<Job>,
    stopped: bool,
}

/// A pool of worker threads consuming submitted jobs in FIFO order.
pub struct WorkerPool {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                stopped: false,
            }),
            cv: Condvar::new(),
        });

        let workers = (0..size)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { queue, workers }
    }

    /// Enqueue a job.  Jobs submitted after [`shutdown`](Self::shutdown) are
    /// silently discarded.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.queue.jobs.lock().unwrap();
        if inner.stopped {
            return;
        }
        inner.pending.push_back(Box::new(job));
        drop(inner);
        self.queue.cv.notify_one();
    }

    /// Stop accepting jobs and wake all workers.  Already-queued jobs are
    /// still executed before the workers exit.
    pub fn shutdown(&self) {
        let mut inner = self.queue.jobs.lock().unwrap();
        inner.stopped = true;
        drop(inner);
        self.queue.cv.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: &Queue) {
    loop {
        let mut inner = queue.jobs.lock().unwrap();
        inner = queue
            .cv
            .wait_while(inner, |q| q.pending.is_empty() && !q.stopped)
            .unwrap();
        match inner.pending.pop_front() {
            Some(job) => {
                drop(inner);
                job();
            }
            None => return, // stopped and drained
        }
    }
}
