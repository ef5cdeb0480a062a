//! Repository interface over the shared worker/job store.
//!
//! Scanners never hold references into the store. Each cycle opens a
//! [`Transaction`], reads plain records out of it, writes changed records
//! back, and either commits or aborts. The transaction is the only context a
//! cycle carries; there is no ambient connection state.

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::farm::{Capabilities, Job, JobId, Worker};

pub use memory::{FarmSeed, MemoryStore};

#[async_trait]
pub trait FarmStore: Send + Sync + 'static {
    /// Open a transaction scoped to one scan cycle.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Registry read used by fleet discovery.
    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn worker(&mut self, name: &str) -> Result<Worker, StoreError>;

    async fn job(&mut self, id: JobId) -> Result<Job, StoreError>;

    async fn put_worker(&mut self, worker: Worker) -> Result<(), StoreError>;

    async fn put_job(&mut self, job: Job) -> Result<(), StoreError>;

    /// Next pending job the given capabilities can run, highest priority
    /// first, oldest first among equals. The job is not claimed until the
    /// caller writes it back and commits.
    async fn acquire_next_job(&mut self, caps: &Capabilities) -> Result<Option<Job>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every staged write.
    async fn abort(self: Box<Self>);
}

/// Re-read the worker's current job. A job that no longer points back at the
/// worker, or no longer exists, is dropped from the worker's slot.
pub async fn load_current_job(
    txn: &mut dyn Transaction,
    worker: &mut Worker,
) -> Result<Option<Job>, StoreError> {
    let Some(id) = worker.current_job else {
        return Ok(None);
    };
    match txn.job(id).await {
        Ok(job) if job.assigned_worker.as_deref() == Some(worker.name.as_str()) => Ok(Some(job)),
        Ok(_) | Err(StoreError::JobNotFound(_)) => {
            tracing::warn!(worker = %worker.name, job_id = %id, "Dropping stale job reference");
            worker.current_job = None;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
