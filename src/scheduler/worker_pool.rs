//! Bounded worker pool for independent per-sample work.
//!
//! The pool is a parallel map: given N independent inputs it produces N
//! results, `results[i]` belonging to `items[i]`. Each unit runs as its own
//! tokio task; a semaphore keeps at most `num_workers` of them in flight.
//!
//! # Features
//!
//! - Configurable number of workers, sized from the host by default
//! - Cancellation checked before each unit starts
//! - A panicking unit fails only itself
//! - Pool statistics tracking

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::metrics::MetricsCollector;

/// Default number of workers per processing unit.
pub const DEFAULT_POOL_MULTIPLIER: usize = 2;

/// Errors produced by the pool itself rather than by a unit of work.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The run was cancelled before this unit started.
    #[error("Cancelled before start")]
    Cancelled,

    /// The unit panicked or was aborted.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// The pool's semaphore was closed.
    #[error("Worker pool is closed")]
    Closed,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum number of units in flight.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_parallelism(DEFAULT_POOL_MULTIPLIER)
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with a fixed number of workers (at least one).
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
        }
    }

    /// Sizes the pool to `multiplier` workers per available processing unit.
    pub fn from_parallelism(multiplier: usize) -> Self {
        Self::new(available_parallelism() * multiplier.max(1))
    }
}

/// Number of processing units on this host, at least one.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Shared cancellation flag, checked at unit boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of units currently running.
    pub active_workers: usize,
    /// Total number of units completed successfully.
    pub jobs_completed: u64,
    /// Total number of units that failed.
    pub jobs_failed: u64,
    /// Average unit duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of units processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Bounded pool of concurrent work units.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationFlag,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a new worker pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self::with_cancellation(config, CancellationFlag::new())
    }

    /// Creates a worker pool that observes an existing cancellation flag.
    pub fn with_cancellation(config: WorkerPoolConfig, cancel: CancellationFlag) -> Self {
        let permits = config.num_workers.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            cancel,
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Runs `f` over every item with bounded parallelism.
    ///
    /// Results are returned in input order. Units that start after
    /// cancellation fail with [`PoolError::Cancelled`]; a unit that panics
    /// fails with [`PoolError::WorkerPanicked`] and does not affect others.
    pub async fn map<I, T, E, F, Fut>(&self, items: Vec<I>, f: F) -> Vec<Result<T, E>>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: From<PoolError> + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if items.is_empty() {
            return Vec::new();
        }

        debug!(
            items = items.len(),
            num_workers = self.config.num_workers,
            "Dispatching work units"
        );

        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let semaphore = Arc::clone(&self.semaphore);
            let stats = Arc::clone(&self.stats);
            let cancel = self.cancel.clone();
            let f = Arc::clone(&f);

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.record_failure(Duration::ZERO);
                        return Err(E::from(PoolError::Closed));
                    }
                };

                if cancel.is_cancelled() {
                    stats.record_failure(Duration::ZERO);
                    return Err(E::from(PoolError::Cancelled));
                }

                let metrics = MetricsCollector::new();
                metrics.set_active_workers(stats.increment_active() as usize);
                let start = Instant::now();

                let result = f(item).await;

                let duration = start.elapsed();
                metrics.set_active_workers(stats.decrement_active() as usize);
                match &result {
                    Ok(_) => stats.record_completion(duration),
                    Err(_) => stats.record_failure(duration),
                }
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(error = %e, "Work unit panicked");
                    // The unit never reached its own bookkeeping
                    MetricsCollector::new()
                        .set_active_workers(self.stats.decrement_active() as usize);
                    self.stats.record_failure(Duration::ZERO);
                    results.push(Err(E::from(PoolError::WorkerPanicked(e.to_string()))));
                }
            }
        }

        let stats = self.stats();
        info!(
            processed = stats.total_processed(),
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            success_rate = stats.success_rate(),
            average_ms = stats.average_job_duration.as_millis() as u64,
            "Work units finished"
        );

        results
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the cancellation flag observed by this pool.
    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum UnitError {
        Odd(usize),
        Pool(PoolError),
    }

    impl From<PoolError> for UnitError {
        fn from(e: PoolError) -> Self {
            UnitError::Pool(e)
        }
    }

    #[test]
    fn test_worker_pool_config() {
        assert_eq!(WorkerPoolConfig::new(0).num_workers, 1);
        assert_eq!(WorkerPoolConfig::new(8).num_workers, 8);

        let config = WorkerPoolConfig::from_parallelism(2);
        assert_eq!(config.num_workers, available_parallelism() * 2);
        assert!(WorkerPoolConfig::default().num_workers >= 2);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[tokio::test]
    async fn test_map_preserves_order() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(3));
        let items: Vec<usize> = (0..20).collect();

        let results = pool
            .map(items, |i| async move {
                // Later items finish first
                tokio::time::sleep(Duration::from_millis((20 - i as u64) * 2)).await;
                Ok::<usize, UnitError>(i * 10)
            })
            .await;

        let values: Vec<usize> = results.into_iter().map(|r| r.expect("ok")).collect();
        assert_eq!(values, (0..20).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_map_bounds_concurrency() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let results = pool
            .map((0..10).collect::<Vec<usize>>(), move |_| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), UnitError>(())
                }
            })
            .await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_map_isolates_failures() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(4));
        let results = pool
            .map((0..6).collect::<Vec<usize>>(), |i| async move {
                if i % 2 == 1 {
                    Err(UnitError::Odd(i))
                } else {
                    Ok(i)
                }
            })
            .await;

        assert!(matches!(results[1], Err(UnitError::Odd(1))));
        assert!(matches!(results[4], Ok(4)));
        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 3);
        assert_eq!(stats.jobs_failed, 3);
    }

    #[tokio::test]
    async fn test_map_contains_panics() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2));
        let results = pool
            .map(vec![0usize, 1, 2], |i| async move {
                if i == 1 {
                    panic!("unit blew up");
                }
                Ok::<usize, UnitError>(i)
            })
            .await;

        assert!(matches!(results[0], Ok(0)));
        assert!(matches!(
            results[1],
            Err(UnitError::Pool(PoolError::WorkerPanicked(_)))
        ));
        assert!(matches!(results[2], Ok(2)));

        let stats = pool.stats();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.total_processed(), 3);
    }

    #[tokio::test]
    async fn test_map_respects_cancellation() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let pool = WorkerPool::with_cancellation(WorkerPoolConfig::new(2), cancel);

        let results = pool
            .map(vec![1usize, 2, 3], |i| async move { Ok::<usize, UnitError>(i) })
            .await;

        assert!(results
            .iter()
            .all(|r| matches!(r, Err(UnitError::Pool(PoolError::Cancelled)))));
        assert!(pool.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_map_empty() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2));
        let results = pool
            .map(Vec::<usize>::new(), |i| async move { Ok::<usize, UnitError>(i) })
            .await;
        assert!(results.is_empty());
    }
}
