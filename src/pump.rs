//! Bounded consumer for pull-style job sources.
//!
//! Some work is not tied to a particular worker: anything that can pull a
//! task from a source and run it to completion. [`ConsumerPump`] keeps at
//! most `capacity` such tasks running, polls for the next one whenever a
//! slot frees up, and backs off by a fixed interval while the source is
//! empty.
//!
//! The pump is a library component. `buildd-lite serve` drives the fleet
//! through one [`crate::scanner::WorkerScanner`] per worker and does not
//! start a pump; embedders with a puller-style source run one themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ManagerConfig;
use crate::error::Result;

#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    type Task: PumpTask;

    /// Next runnable task, or `None` if there is nothing to do right now.
    async fn poll(&self) -> Result<Option<Self::Task>>;
}

#[async_trait]
pub trait PumpTask: Send + 'static {
    /// Short description for logs.
    fn describe(&self) -> String;

    async fn run(self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Counters {
    polled: AtomicU64,
    empty_polls: AtomicU64,
    poll_errors: AtomicU64,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub polled: u64,
    pub empty_polls: u64,
    pub poll_errors: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct ConsumerPump<S: JobSource> {
    source: Arc<S>,
    permits: Arc<Semaphore>,
    capacity: usize,
    idle_interval: Duration,
    tasks: TaskTracker,
    counters: Arc<Counters>,
}

impl<S: JobSource> ConsumerPump<S> {
    pub fn new(source: S, capacity: usize, idle_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            source: Arc::new(source),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            idle_interval,
            tasks: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Capacity from `max_concurrent_jobs`, or the fleet size when unset.
    /// The idle interval is the scan interval.
    pub fn from_config(source: S, config: &ManagerConfig, fleet_size: usize) -> Self {
        Self::new(source, config.pump_capacity(fleet_size), config.scan_interval)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn stats(&self) -> PumpStats {
        let c = &self.counters;
        PumpStats {
            polled: c.polled.load(Ordering::Relaxed),
            empty_polls: c.empty_polls.load(Ordering::Relaxed),
            poll_errors: c.poll_errors.load(Ordering::Relaxed),
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Pull and run tasks until `shutdown` fires, then wait for the running
    /// ones to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            // Take a slot before polling so a task is never pulled without
            // room to run it.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // A poll may already have claimed its task, so it is never
            // dropped midway. Shutdown is seen on the next iteration.
            self.counters.polled.fetch_add(1, Ordering::Relaxed);
            let polled = self.source.poll().await;

            match polled {
                Ok(Some(task)) => {
                    let description = task.describe();
                    let counters = self.counters.clone();
                    counters.started.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task = %description, "Task started");
                    self.tasks.spawn(async move {
                        match task.run().await {
                            Ok(()) => {
                                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(task = %description, "Task finished");
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(task = %description, error = %e, "Task failed");
                            }
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.counters.empty_polls.fetch_add(1, Ordering::Relaxed);
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    self.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Job source poll failed");
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
        tracing::debug!(stats = ?self.stats(), "Pump drained");
    }

    /// Wait one idle interval. Returns true if shutdown fired meanwhile.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.idle_interval) => false,
        }
    }
}
