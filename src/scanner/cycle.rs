use crate::error::StoreError;
use crate::farm::{Job, JobId, JobStatus, Worker};
use crate::store::{load_current_job, FarmStore, Transaction};

/// State carried through one scan cycle.
///
/// Holds the cycle's transaction and working copies of the worker and the
/// job it touched. Nothing is written until [`CycleContext::commit`]; a
/// failed cycle calls [`CycleContext::abort`] and every change is dropped.
pub struct CycleContext {
    pub cycle: u64,
    txn: Box<dyn Transaction>,
    pub worker: Worker,
    /// The job this cycle loaded or claimed. It stays here after being
    /// released from the worker so the release is written back too.
    pub job: Option<Job>,
    loaded_worker: Worker,
    loaded_job: Option<Job>,
}

impl CycleContext {
    /// Open a transaction and load the worker with its current job.
    /// Returns `None` if the worker is no longer registered.
    pub async fn open(
        store: &dyn FarmStore,
        name: &str,
        cycle: u64,
    ) -> Result<Option<Self>, StoreError> {
        let mut txn = store.begin().await?;
        let mut worker = match txn.worker(name).await {
            Ok(worker) => worker,
            Err(StoreError::WorkerNotFound(_)) => {
                txn.abort().await;
                return Ok(None);
            }
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        let loaded_worker = worker.clone();
        let job = match load_current_job(txn.as_mut(), &mut worker).await {
            Ok(job) => job,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };

        Ok(Some(Self {
            cycle,
            txn,
            loaded_job: job.clone(),
            job,
            loaded_worker,
            worker,
        }))
    }

    pub fn txn(&mut self) -> &mut dyn Transaction {
        self.txn.as_mut()
    }

    /// The job the worker currently holds, if any.
    pub fn held_job(&self) -> Option<&Job> {
        let id = self.worker.current_job?;
        self.job.as_ref().filter(|j| j.id == id)
    }

    pub fn held_job_mut(&mut self) -> Option<&mut Job> {
        let id = self.worker.current_job?;
        self.job.as_mut().filter(|j| j.id == id)
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job.as_ref().map(|j| j.id)
    }

    /// Put `job` in the worker's slot.
    pub fn assign(&mut self, mut job: Job) {
        job.start(&self.worker.name);
        self.worker.current_job = Some(job.id);
        self.job = Some(job);
    }

    /// Write back whatever changed and commit.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        let staged = self.stage().await;
        match staged {
            Ok(()) => self.txn.commit().await,
            Err(e) => {
                self.txn.abort().await;
                Err(e)
            }
        }
    }

    /// Like [`CycleContext::commit`], but a conflict with an operator write
    /// does not throw the cycle away. By the time a cycle commits it may
    /// already have acted on the worker, so its writes are re-applied on
    /// top of the fresh records. Only a concurrent change to the worker's
    /// slot or to anything other than a cancel request is still a conflict.
    pub async fn commit_or_replay(mut self, store: &dyn FarmStore) -> Result<(), StoreError> {
        if let Err(e) = self.stage().await {
            self.txn.abort().await;
            return Err(e);
        }
        let Self {
            txn,
            worker,
            job,
            loaded_worker,
            loaded_job,
            ..
        } = self;
        match txn.commit().await {
            Err(StoreError::Conflict(detail)) => {
                tracing::debug!(worker = %worker.name, %detail, "Replaying cycle writes");
                let changes = Changes {
                    worker: &worker,
                    loaded_worker: &loaded_worker,
                    job: job.as_ref(),
                    loaded_job: loaded_job.as_ref(),
                };
                changes.replay(store, detail).await
            }
            other => other,
        }
    }

    async fn stage(&mut self) -> Result<(), StoreError> {
        if self.worker != self.loaded_worker {
            self.txn.put_worker(self.worker.clone()).await?;
        }
        if let Some(job) = &self.job {
            if self.loaded_job.as_ref() != Some(job) {
                self.txn.put_job(job.clone()).await?;
            }
        }
        Ok(())
    }

    pub async fn abort(self) {
        self.txn.abort().await;
    }
}

struct Changes<'a> {
    worker: &'a Worker,
    loaded_worker: &'a Worker,
    job: Option<&'a Job>,
    loaded_job: Option<&'a Job>,
}

impl Changes<'_> {
    async fn replay(&self, store: &dyn FarmStore, detail: String) -> Result<(), StoreError> {
        let mut txn = store.begin().await?;
        match self.rebase(txn.as_mut()).await {
            Ok(true) => txn.commit().await,
            Ok(false) => {
                txn.abort().await;
                Err(StoreError::Conflict(detail))
            }
            Err(e) => {
                txn.abort().await;
                Err(e)
            }
        }
    }

    /// Stage the cycle's writes over the current records. Returns false if
    /// they cannot be merged.
    async fn rebase(&self, txn: &mut dyn Transaction) -> Result<bool, StoreError> {
        if self.worker != self.loaded_worker {
            // A cycle only ever moves the worker's slot.
            let mut fresh = txn.worker(&self.worker.name).await?;
            if fresh.current_job != self.loaded_worker.current_job {
                return Ok(false);
            }
            fresh.current_job = self.worker.current_job;
            txn.put_worker(fresh).await?;
        }
        if let Some(job) = self.job {
            if self.loaded_job != Some(job) {
                let fresh = txn.job(job.id).await?;
                match rebase_job(fresh, self.loaded_job, job) {
                    Some(merged) => txn.put_job(merged).await?,
                    None => return Ok(false),
                }
            }
        }
        Ok(true)
    }
}

/// Merge the cycle's copy of a job with the stored one. The only concurrent
/// job write that merges is a cancel request against the running build.
fn rebase_job(fresh: Job, loaded: Option<&Job>, ours: &Job) -> Option<Job> {
    let loaded = loaded?;
    if &fresh == loaded {
        return Some(ours.clone());
    }
    let cancel_requested = loaded.status == JobStatus::Running
        && fresh.status == JobStatus::Cancelling
        && Job {
            status: loaded.status,
            ..fresh.clone()
        } == *loaded;
    if !cancel_requested {
        return None;
    }

    if ours.status.is_terminal() {
        // The build already finished and its files are collected.
        return Some(ours.clone());
    }
    let mut merged = fresh;
    match ours.status {
        JobStatus::Pending => merged.finish(JobStatus::Cancelled, Some("cancelled".into())),
        _ => merged.log_tail = ours.log_tail.clone(),
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Job {
        let mut job = Job::new("hello_2.10-1", "amd64", "chroot-noble-amd64");
        job.start("bob");
        job
    }

    #[test]
    fn unchanged_record_takes_our_copy() {
        let loaded = running();
        let mut ours = loaded.clone();
        ours.finish(JobStatus::Succeeded, None);
        assert_eq!(rebase_job(loaded.clone(), Some(&loaded), &ours), Some(ours));
    }

    #[test]
    fn cancel_request_merges_with_a_finished_build() {
        let loaded = running();
        let mut fresh = loaded.clone();
        fresh.status = JobStatus::Cancelling;

        let mut done = loaded.clone();
        done.finish(JobStatus::Succeeded, None);
        assert_eq!(
            rebase_job(fresh.clone(), Some(&loaded), &done).map(|j| j.status),
            Some(JobStatus::Succeeded)
        );

        let mut given_back = loaded.clone();
        given_back.reset();
        let merged = rebase_job(fresh.clone(), Some(&loaded), &given_back);
        assert_eq!(merged.as_ref().map(|j| j.status), Some(JobStatus::Cancelled));
        assert!(merged.and_then(|j| j.assigned_worker).is_none());

        let mut building = loaded.clone();
        building.log_tail = Some("make[1]: Entering directory".into());
        let merged = rebase_job(fresh, Some(&loaded), &building);
        assert_eq!(merged.as_ref().map(|j| j.status), Some(JobStatus::Cancelling));
        assert_eq!(
            merged.and_then(|j| j.log_tail).as_deref(),
            Some("make[1]: Entering directory")
        );
    }

    #[test]
    fn any_other_concurrent_change_conflicts() {
        let loaded = running();
        let mut ours = loaded.clone();
        ours.finish(JobStatus::Succeeded, None);

        let mut retried = loaded.clone();
        retried.failure_count += 1;
        assert_eq!(rebase_job(retried, Some(&loaded), &ours), None);

        let mut moved = loaded.clone();
        moved.status = JobStatus::Cancelling;
        moved.assigned_worker = Some("alice".into());
        assert_eq!(rebase_job(moved, Some(&loaded), &ours), None);

        assert_eq!(rebase_job(loaded.clone(), None, &ours), None);
    }
}
