//! Bounded concurrent execution of per-sample work.
//!
//! - **WorkerPool**: parallel map over independent units, bounded by a semaphore
//! - **CancellationFlag**: shared flag checked before each unit starts
//!
//! # Example
//!
//! ```rust,ignore
//! use idat_forge::scheduler::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::from_parallelism(2));
//! let results = pool.map(samples, |sample| async move { process(sample).await }).await;
//! ```

pub mod worker_pool;

pub use worker_pool::{
    available_parallelism, CancellationFlag, PoolError, PoolStats, WorkerPool, WorkerPoolConfig,
    DEFAULT_POOL_MULTIPLIER,
};
