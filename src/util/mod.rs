//! Threading utilities: the fixed worker pool and cancellation-aware
//! periodic tasks used by the node core, the RIP engine, and the TCP stack.

pub mod periodic;
pub mod pool;

pub use periodic::PeriodicTask;
pub use pool::WorkerPool;

#[cfg(test)]
mod periodic_tests;
#[cfg(test)]
mod pool_tests;
