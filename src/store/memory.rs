use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::farm::{Capabilities, Job, JobId, JobStatus, Worker};
use crate::store::{FarmStore, Transaction};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Clone)]
struct Versioned<T> {
    value: T,
    version: u64,
}

#[derive(Debug, Default)]
struct Tables {
    workers: BTreeMap<String, Versioned<Worker>>,
    jobs: HashMap<JobId, Versioned<Job>>,
    clock: u64,
}

impl Tables {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn store_worker(&mut self, worker: Worker) {
        let version = self.tick();
        self.workers.insert(
            worker.name.clone(),
            Versioned {
                value: worker,
                version,
            },
        );
    }

    fn store_job(&mut self, job: Job) {
        let version = self.tick();
        self.jobs.insert(job.id, Versioned { value: job, version });
    }
}

/// Initial contents for a [`MemoryStore`], loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmSeed {
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// In-process store with versioned records.
///
/// Transactions stage writes locally and validate, at commit, that nothing
/// they are about to overwrite changed since they read it. Two scanners that
/// both picked the same pending job therefore cannot both claim it.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    commit_faults: Arc<AtomicUsize>,
    max_jobs: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            commit_faults: Arc::new(AtomicUsize::new(0)),
            max_jobs,
        }
    }

    pub async fn from_seed(seed: FarmSeed) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write().await;
            for worker in seed.workers {
                tables.store_worker(worker);
            }
            for job in seed.jobs {
                tables.store_job(job);
            }
        }
        store
    }

    pub async fn load_seed(path: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let seed: FarmSeed = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_seed(seed).await)
    }

    /// Register a worker. Returns false if the name is already taken.
    pub async fn add_worker(&self, worker: Worker) -> bool {
        let mut tables = self.tables.write().await;
        if tables.workers.contains_key(&worker.name) {
            return false;
        }
        tracing::info!(worker = %worker.name, "Worker registered");
        tables.store_worker(worker);
        true
    }

    /// Add a job to the queue. Returns false if the store is at capacity.
    pub async fn enqueue(&self, job: Job) -> bool {
        let mut tables = self.tables.write().await;
        if tables.jobs.len() >= self.max_jobs {
            return false;
        }
        tracing::debug!(job_id = %job.id, name = %job.name, "Job enqueued");
        tables.store_job(job);
        true
    }

    /// Pending jobs are cancelled outright; active ones move to CANCELLING
    /// and are stopped by the scanner that owns the worker.
    pub async fn request_cancel(&self, id: JobId) -> Result<JobStatus, StoreError> {
        let mut tables = self.tables.write().await;
        let mut job = tables
            .jobs
            .get(&id)
            .map(|v| v.value.clone())
            .ok_or(StoreError::JobNotFound(id))?;
        match job.status {
            JobStatus::Pending => {
                job.finish(JobStatus::Cancelled, Some("cancelled before dispatch".into()))
            }
            JobStatus::Running => job.status = JobStatus::Cancelling,
            _ => return Ok(job.status),
        }
        let status = job.status;
        tables.store_job(job);
        Ok(status)
    }

    pub async fn set_manual(&self, name: &str, manual: bool) -> Result<(), StoreError> {
        self.update_worker(name, |w| w.manual = manual).await
    }

    /// Operator action after a worker was failed permanently.
    pub async fn reenable_worker(&self, name: &str) -> Result<(), StoreError> {
        self.update_worker(name, Worker::reenable).await
    }

    async fn update_worker(
        &self,
        name: &str,
        f: impl FnOnce(&mut Worker),
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let mut worker = tables
            .workers
            .get(name)
            .map(|v| v.value.clone())
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;
        f(&mut worker);
        tables.store_worker(worker);
        Ok(())
    }

    pub async fn worker_snapshot(&self, name: &str) -> Option<Worker> {
        self.tables.read().await.workers.get(name).map(|v| v.value.clone())
    }

    pub async fn job_snapshot(&self, id: JobId) -> Option<Job> {
        self.tables.read().await.jobs.get(&id).map(|v| v.value.clone())
    }

    pub async fn workers(&self) -> Vec<Worker> {
        self.tables
            .read()
            .await
            .workers
            .values()
            .map(|v| v.value.clone())
            .collect()
    }

    /// All jobs sorted chronologically by creation time.
    pub async fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .tables
            .read()
            .await
            .jobs
            .values()
            .map(|v| v.value.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Drop terminal jobs. Returns how many were removed.
    pub async fn retire_finished(&self) -> usize {
        let mut tables = self.tables.write().await;
        let before = tables.jobs.len();
        tables.jobs.retain(|_, v| !v.value.status.is_terminal());
        before - tables.jobs.len()
    }

    /// Make the next `n` commits fail as if the backing database were down.
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_faults.store(n, Ordering::SeqCst);
    }

    /// Check the assignment invariants over committed state.
    pub async fn check_invariants(&self) -> Result<(), String> {
        let tables = self.tables.read().await;
        let mut slots: HashMap<&str, JobId> = HashMap::new();

        for Versioned { value: job, .. } in tables.jobs.values() {
            match (job.status, job.assigned_worker.as_deref()) {
                (JobStatus::Running | JobStatus::Cancelling, None) => {
                    return Err(format!("job {} is {} without a worker", job.id, job.status));
                }
                (JobStatus::Pending, Some(w)) => {
                    return Err(format!("pending job {} is assigned to {}", job.id, w));
                }
                (status, Some(w)) if status.is_terminal() => {
                    return Err(format!("{} job {} still holds {}", status, job.id, w));
                }
                (_, Some(w)) => {
                    if let Some(other) = slots.insert(w, job.id) {
                        return Err(format!("worker {} holds jobs {} and {}", w, other, job.id));
                    }
                }
                (_, None) => {}
            }
        }

        for Versioned { value: worker, .. } in tables.workers.values() {
            let held = slots.get(worker.name.as_str()).copied();
            if worker.current_job != held {
                return Err(format!(
                    "worker {} records job {:?} but holds {:?}",
                    worker.name, worker.current_job, held
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FarmStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            commit_faults: self.commit_faults.clone(),
            worker_versions: HashMap::new(),
            job_versions: HashMap::new(),
            worker_writes: HashMap::new(),
            job_writes: HashMap::new(),
        }))
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.workers().await)
    }
}

struct MemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    commit_faults: Arc<AtomicUsize>,
    worker_versions: HashMap<String, u64>,
    job_versions: HashMap<JobId, u64>,
    worker_writes: HashMap<String, Worker>,
    job_writes: HashMap<JobId, Job>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn worker(&mut self, name: &str) -> Result<Worker, StoreError> {
        if let Some(worker) = self.worker_writes.get(name) {
            return Ok(worker.clone());
        }
        let tables = self.tables.read().await;
        let record = tables
            .workers
            .get(name)
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;
        self.worker_versions
            .entry(name.to_string())
            .or_insert(record.version);
        Ok(record.value.clone())
    }

    async fn job(&mut self, id: JobId) -> Result<Job, StoreError> {
        if let Some(job) = self.job_writes.get(&id) {
            return Ok(job.clone());
        }
        let tables = self.tables.read().await;
        let record = tables.jobs.get(&id).ok_or(StoreError::JobNotFound(id))?;
        self.job_versions.entry(id).or_insert(record.version);
        Ok(record.value.clone())
    }

    async fn put_worker(&mut self, worker: Worker) -> Result<(), StoreError> {
        if !self.worker_versions.contains_key(&worker.name) {
            let tables = self.tables.read().await;
            let record = tables
                .workers
                .get(&worker.name)
                .ok_or_else(|| StoreError::WorkerNotFound(worker.name.clone()))?;
            self.worker_versions
                .insert(worker.name.clone(), record.version);
        }
        self.worker_writes.insert(worker.name.clone(), worker);
        Ok(())
    }

    async fn put_job(&mut self, job: Job) -> Result<(), StoreError> {
        if !self.job_versions.contains_key(&job.id) {
            let tables = self.tables.read().await;
            let record = tables.jobs.get(&job.id).ok_or(StoreError::JobNotFound(job.id))?;
            self.job_versions.insert(job.id, record.version);
        }
        self.job_writes.insert(job.id, job);
        Ok(())
    }

    async fn acquire_next_job(&mut self, caps: &Capabilities) -> Result<Option<Job>, StoreError> {
        let tables = self.tables.read().await;
        let next = tables
            .jobs
            .values()
            .map(|record| {
                let job = self.job_writes.get(&record.value.id).unwrap_or(&record.value);
                (job, record.version)
            })
            .filter(|(job, _)| job.status == JobStatus::Pending && caps.matches(job))
            .max_by_key(|(job, _)| (job.priority, Reverse(job.created_at)));

        let Some((job, version)) = next else {
            return Ok(None);
        };
        let job = job.clone();
        drop(tables);
        self.job_versions.entry(job.id).or_insert(version);
        Ok(Some(job))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let remaining = self.commit_faults.load(Ordering::SeqCst);
        if remaining > 0 {
            self.commit_faults.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("commit rejected by store".into()));
        }

        let shared = self.tables.clone();
        let mut tables = shared.write().await;
        for name in self.worker_writes.keys() {
            let current = tables.workers.get(name).map(|v| v.version);
            if current != self.worker_versions.get(name).copied() {
                return Err(StoreError::Conflict(format!("worker {}", name)));
            }
        }
        for id in self.job_writes.keys() {
            let current = tables.jobs.get(id).map(|v| v.version);
            if current != self.job_versions.get(id).copied() {
                return Err(StoreError::Conflict(format!("job {}", id)));
            }
        }

        let MemoryTransaction {
            worker_writes,
            job_writes,
            ..
        } = *self;
        for (_, worker) in worker_writes {
            tables.store_worker(worker);
        }
        for (_, job) in job_writes {
            tables.store_job(job);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        if !self.worker_writes.is_empty() || !self.job_writes.is_empty() {
            tracing::debug!(
                workers = self.worker_writes.len(),
                jobs = self.job_writes.len(),
                "Discarding staged writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn amd64() -> Capabilities {
        Capabilities {
            processors: vec!["amd64".to_string()],
            virtualized: false,
        }
    }

    #[tokio::test]
    async fn acquire_prefers_priority_then_age() {
        let store = MemoryStore::new();
        let mut old = Job::new("old", "amd64", "c");
        old.created_at = Utc::now() - Duration::minutes(5);
        let new = Job::new("new", "amd64", "c");
        let urgent = Job::new("urgent", "amd64", "c").with_priority(10);
        let other_arch = Job::new("arm", "arm64", "c").with_priority(100);
        let urgent_id = urgent.id;
        let old_id = old.id;

        for job in [old, new, urgent, other_arch] {
            assert!(store.enqueue(job).await);
        }

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.acquire_next_job(&amd64()).await.unwrap().unwrap().id, urgent_id);
        txn.abort().await;

        store.request_cancel(urgent_id).await.unwrap();
        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.acquire_next_job(&amd64()).await.unwrap().unwrap().id, old_id);
    }

    #[tokio::test]
    async fn concurrent_claims_conflict() {
        let store = MemoryStore::new();
        store.add_worker(Worker::new("a", "http://a", &["amd64"])).await;
        store.add_worker(Worker::new("b", "http://b", &["amd64"])).await;
        store.enqueue(Job::new("only", "amd64", "c")).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut job_a = first.acquire_next_job(&amd64()).await.unwrap().unwrap();
        let mut job_b = second.acquire_next_job(&amd64()).await.unwrap().unwrap();
        assert_eq!(job_a.id, job_b.id);

        job_a.start("a");
        first.put_job(job_a).await.unwrap();
        job_b.start("b");
        second.put_job(job_b).await.unwrap();

        assert!(first.commit().await.is_ok());
        assert!(matches!(second.commit().await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn abort_discards_writes() {
        let store = MemoryStore::new();
        store.add_worker(Worker::new("a", "http://a", &["amd64"])).await;

        let mut txn = store.begin().await.unwrap();
        let mut worker = txn.worker("a").await.unwrap();
        worker.failure_count = 7;
        txn.put_worker(worker).await.unwrap();
        assert_eq!(txn.worker("a").await.unwrap().failure_count, 7);
        txn.abort().await;

        assert_eq!(store.worker_snapshot("a").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn injected_commit_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.add_worker(Worker::new("a", "http://a", &["amd64"])).await;
        store.fail_next_commits(1);

        let mut txn = store.begin().await.unwrap();
        let worker = txn.worker("a").await.unwrap();
        txn.put_worker(worker.clone()).await.unwrap();
        assert!(matches!(txn.commit().await, Err(StoreError::Unavailable(_))));

        let mut txn = store.begin().await.unwrap();
        txn.put_worker(worker).await.unwrap();
        assert!(txn.commit().await.is_ok());
    }

    #[tokio::test]
    async fn request_cancel_depends_on_status() {
        let store = MemoryStore::new();
        let pending = Job::new("p", "amd64", "c");
        let mut running = Job::new("r", "amd64", "c");
        running.start("a");
        let (pending_id, running_id) = (pending.id, running.id);
        store.enqueue(pending).await;
        store.enqueue(running).await;

        assert_eq!(store.request_cancel(pending_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(store.request_cancel(running_id).await.unwrap(), JobStatus::Cancelling);
        assert!(store.request_cancel(uuid::Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn invariants_catch_double_assignment() {
        let store = MemoryStore::new();
        let mut worker = Worker::new("a", "http://a", &["amd64"]);
        let mut one = Job::new("1", "amd64", "c");
        let mut two = Job::new("2", "amd64", "c");
        one.start("a");
        two.start("a");
        worker.current_job = Some(one.id);
        store.add_worker(worker).await;
        store.enqueue(one).await;
        store.enqueue(two).await;

        assert!(store.check_invariants().await.is_err());
    }

    #[tokio::test]
    async fn retire_finished_keeps_active_jobs() {
        let store = MemoryStore::new();
        let mut done = Job::new("done", "amd64", "c");
        done.finish(JobStatus::Succeeded, None);
        store.enqueue(done).await;
        store.enqueue(Job::new("queued", "amd64", "c")).await;

        assert_eq!(store.retire_finished().await, 1);
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn seed_round_trips_through_json() {
        let seed: FarmSeed = serde_json::from_str(
            r#"{
                "workers": [{"name": "bob", "url": "http://bob:8221", "processors": ["amd64"]}],
                "jobs": [{"name": "hello", "processor": "amd64", "chroot": "noble"}]
            }"#,
        )
        .unwrap();
        let store = MemoryStore::from_seed(seed).await;

        assert_eq!(store.workers().await.len(), 1);
        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }
}
