//! Worker threads and the worker pool.

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::WorkerThread;
