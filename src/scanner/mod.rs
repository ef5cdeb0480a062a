//! Per-worker scan loop.
//!
//! One [`WorkerScanner`] exists per worker. Every cycle walks the same steps:
//!
//! 1. **Cancellation**: a CANCELLING job gets one abort request, then is
//!    watched until the worker stops or the cancel timeout runs out
//! 2. **Rescue**: a worker that is out of service loses its job; a worker
//!    whose reported job disagrees with the store is cleaned up
//! 3. **Progress**: log tails are recorded and finished builds collected
//! 4. **Dispatch**: an idle, automatic worker is given the next matching job
//!
//! Any error aborts the cycle's transaction and is handed to the
//! [`FailureTracker`]. The next cycle only starts once the current one,
//! including its error handling, has finished.

pub mod cycle;
pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::{DispatchError, StoreError};
use crate::failure::{release_job, Escalation, FailureTracker};
use crate::farm::{JobId, JobStatus};
use crate::pipeline::{UploadOutcome, UploadPipeline};
use crate::store::FarmStore;
use crate::worker::{BuildResult, DispatchRequest, WorkerHandle, WorkerStatus};

pub use cycle::CycleContext;

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// The worker is not in the store any more.
    Unregistered,
    /// Out of service and holding nothing.
    Offline,
    /// Nothing to dispatch.
    Idle,
    /// Operator has taken the worker out of automatic dispatch.
    Manual,
    /// The worker is neither idle nor running a job we know about.
    Busy { status: String },
    AbortRequested { job_id: JobId },
    AwaitingAbort { job_id: JobId },
    Cancelled { job_id: JobId },
    /// The store and the worker disagreed; the job (if any) was released.
    Rescued { job_id: Option<JobId> },
    /// The worker went out of service while holding a job.
    ReleasedFromOffline { job_id: JobId },
    Building { job_id: JobId },
    Collected { job_id: JobId, status: JobStatus },
    Dispatched { job_id: JobId },
    /// Another scanner claimed the job first.
    ClaimLost { job_id: JobId },
    /// A concurrent write touched the same records; retried next cycle.
    Conflict { detail: String },
    Escalated(Escalation),
    /// Recording the failure itself failed.
    EscalationFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub worker: String,
    pub cycle: u64,
    pub outcome: ScanOutcome,
    pub finished_at: DateTime<Utc>,
}

/// How a cycle ended when it did not end with a commit.
enum Next {
    Commit(ScanOutcome),
    Dispatch(JobId),
}

enum Failure {
    Scan(DispatchError),
    /// The abort RPC for a cancelling job failed.
    Abort(DispatchError),
}

impl From<DispatchError> for Failure {
    fn from(e: DispatchError) -> Self {
        Failure::Scan(e)
    }
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Scan(e.into())
    }
}

pub struct WorkerScanner {
    name: String,
    store: Arc<dyn FarmStore>,
    handle: Arc<dyn WorkerHandle>,
    pipeline: Arc<dyn UploadPipeline>,
    tracker: FailureTracker,
    scan_interval: Duration,
    cancel_timeout: Duration,
    stagger: bool,
    cycle: u64,
    /// Job an abort was sent for, and when the worker must have stopped.
    cancel_deadline: Option<(JobId, Instant)>,
    reports: watch::Sender<Option<ScanReport>>,
}

impl WorkerScanner {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn FarmStore>,
        handle: Arc<dyn WorkerHandle>,
        pipeline: Arc<dyn UploadPipeline>,
        config: &ManagerConfig,
    ) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            name: name.into(),
            store,
            handle,
            pipeline,
            tracker: FailureTracker::new(config.thresholds),
            scan_interval: config.scan_interval,
            cancel_timeout: config.cancel_timeout,
            stagger: config.stagger_scans,
            cycle: 0,
            cancel_deadline: None,
            reports,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest report, updated after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<Option<ScanReport>> {
        self.reports.subscribe()
    }

    /// Scan on a fixed interval until `shutdown` fires. A cycle already in
    /// progress when it fires runs to completion.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.stagger {
            let delay = timer::initial_stagger(self.scan_interval);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!(worker = %self.name, interval_ms = self.scan_interval.as_millis() as u64, "Scanner started");

        loop {
            let report = self.scan_once().await;
            tracing::debug!(worker = %self.name, cycle = report.cycle, outcome = ?report.outcome, "Scan finished");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }

        tracing::info!(worker = %self.name, cycles = self.cycle, "Scanner stopped");
    }

    /// Run exactly one cycle, including failure handling.
    pub async fn scan_once(&mut self) -> ScanReport {
        self.cycle += 1;
        let outcome = self.cycle_outcome().await;
        let report = ScanReport {
            worker: self.name.clone(),
            cycle: self.cycle,
            outcome,
            finished_at: Utc::now(),
        };
        self.reports.send_replace(Some(report.clone()));
        report
    }

    async fn cycle_outcome(&mut self) -> ScanOutcome {
        let mut ctx = match CycleContext::open(&*self.store, &self.name, self.cycle).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                tracing::warn!(worker = %self.name, "Worker no longer registered");
                return ScanOutcome::Unregistered;
            }
            Err(e) => return self.scan_failed(Failure::from(e)).await,
        };

        match self.run_cycle(&mut ctx).await {
            Ok(Next::Commit(outcome)) => match ctx.commit_or_replay(&*self.store).await {
                Ok(()) => outcome,
                Err(StoreError::Conflict(detail)) => {
                    tracing::info!(worker = %self.name, %detail, "Cycle lost a write race");
                    ScanOutcome::Conflict { detail }
                }
                Err(e) => self.scan_failed(Failure::from(e)).await,
            },
            Ok(Next::Dispatch(job_id)) => {
                let request = match ctx.held_job() {
                    Some(job) => DispatchRequest::from(job),
                    None => {
                        ctx.abort().await;
                        let e = DispatchError::Internal("claimed job missing from cycle".into());
                        return self.scan_failed(Failure::from(e)).await;
                    }
                };
                match ctx.commit().await {
                    Ok(()) => self.dispatch(request).await,
                    Err(StoreError::Conflict(_)) => {
                        tracing::debug!(worker = %self.name, job_id = %job_id, "Job claimed elsewhere");
                        ScanOutcome::ClaimLost { job_id }
                    }
                    Err(e) => self.scan_failed(Failure::from(e)).await,
                }
            }
            Err(failure) => {
                ctx.abort().await;
                self.scan_failed(failure).await
            }
        }
    }

    async fn run_cycle(&mut self, ctx: &mut CycleContext) -> Result<Next, Failure> {
        if let Some(outcome) = self.check_cancel(ctx).await? {
            return Ok(Next::Commit(outcome));
        }

        if !ctx.worker.ok {
            return Ok(Next::Commit(self.release_offline(ctx)));
        }

        let status = self.handle.status().await?;

        if let Some(outcome) = self.rescue_if_lost(ctx, &status).await? {
            return Ok(Next::Commit(outcome));
        }

        if let Some(outcome) = self.update_build(ctx, status.clone()).await? {
            return Ok(Next::Commit(outcome));
        }

        if ctx.worker.manual {
            return Ok(Next::Commit(ScanOutcome::Manual));
        }
        if !status.is_idle() {
            return Ok(Next::Commit(ScanOutcome::Busy {
                status: status.label().to_string(),
            }));
        }

        let caps = ctx.worker.capabilities();
        match ctx.txn().acquire_next_job(&caps).await? {
            Some(job) => {
                let job_id = job.id;
                ctx.assign(job);
                Ok(Next::Dispatch(job_id))
            }
            None => Ok(Next::Commit(ScanOutcome::Idle)),
        }
    }

    async fn check_cancel(&mut self, ctx: &mut CycleContext) -> Result<Option<ScanOutcome>, Failure> {
        let job_id = match ctx.held_job() {
            Some(job) if job.status == JobStatus::Cancelling => job.id,
            _ => {
                self.cancel_deadline = None;
                return Ok(None);
            }
        };

        if !ctx.worker.ok {
            self.cancel_deadline = None;
            finish_cancelled(ctx);
            tracing::info!(worker = %self.name, job_id = %job_id, "Cancelled job on out-of-service worker");
            return Ok(Some(ScanOutcome::Cancelled { job_id }));
        }

        let deadline = match self.cancel_deadline {
            Some((id, deadline)) if id == job_id => deadline,
            _ => {
                if let Err(e) = self.handle.request_abort().await {
                    self.cancel_deadline = None;
                    return Err(Failure::Abort(e));
                }
                self.cancel_deadline = Some((job_id, Instant::now() + self.cancel_timeout));
                tracing::info!(worker = %self.name, job_id = %job_id, "Abort requested");
                return Ok(Some(ScanOutcome::AbortRequested { job_id }));
            }
        };

        match self.handle.status().await? {
            WorkerStatus::Building { .. } | WorkerStatus::Aborting { .. } => {
                if Instant::now() >= deadline {
                    self.cancel_deadline = None;
                    return Err(Failure::Scan(DispatchError::CancelTimeout {
                        worker: self.name.clone(),
                        job_id,
                        timeout_secs: self.cancel_timeout.as_secs(),
                    }));
                }
                Ok(Some(ScanOutcome::AwaitingAbort { job_id }))
            }
            status @ (WorkerStatus::Aborted { .. } | WorkerStatus::Waiting { .. }) => {
                self.handle.clean().await?;
                self.cancel_deadline = None;
                finish_cancelled(ctx);
                tracing::info!(worker = %self.name, job_id = %job_id, status = status.label(), "Job cancelled");
                Ok(Some(ScanOutcome::Cancelled { job_id }))
            }
            WorkerStatus::Idle => {
                self.cancel_deadline = None;
                finish_cancelled(ctx);
                tracing::info!(worker = %self.name, job_id = %job_id, "Job cancelled");
                Ok(Some(ScanOutcome::Cancelled { job_id }))
            }
        }
    }

    fn release_offline(&self, ctx: &mut CycleContext) -> ScanOutcome {
        let Some(job_id) = ctx.worker.current_job else {
            return ScanOutcome::Offline;
        };
        if let Some(job) = ctx.job.as_mut() {
            release_job(job, &mut ctx.worker);
        }
        ctx.worker.current_job = None;
        tracing::info!(worker = %self.name, job_id = %job_id, "Released job from out-of-service worker");
        ScanOutcome::ReleasedFromOffline { job_id }
    }

    /// Reconcile the worker's own view of its job with the store's.
    async fn rescue_if_lost(
        &mut self,
        ctx: &mut CycleContext,
        status: &WorkerStatus,
    ) -> Result<Option<ScanOutcome>, Failure> {
        let expected = ctx.held_job().map(|j| j.id);
        let reported = status.job_id();
        if expected == reported {
            return Ok(None);
        }

        tracing::warn!(
            worker = %self.name,
            expected = ?expected,
            reported = ?reported,
            status = status.label(),
            "Worker and store disagree, rescuing"
        );
        match status {
            WorkerStatus::Building { .. } | WorkerStatus::Aborting { .. } => {
                self.handle.request_abort().await?
            }
            WorkerStatus::Waiting { .. } | WorkerStatus::Aborted { .. } => self.handle.clean().await?,
            WorkerStatus::Idle => {}
        }
        if let Some(job) = ctx.held_job_mut() {
            job.reset();
        }
        ctx.worker.current_job = None;
        Ok(Some(ScanOutcome::Rescued { job_id: expected }))
    }

    async fn update_build(
        &mut self,
        ctx: &mut CycleContext,
        status: WorkerStatus,
    ) -> Result<Option<ScanOutcome>, Failure> {
        let Some(job_id) = ctx.held_job().map(|j| j.id) else {
            return Ok(None);
        };

        match status {
            WorkerStatus::Building { log_tail, .. } => {
                if let Some(job) = ctx.held_job_mut() {
                    job.log_tail = log_tail;
                }
                Ok(Some(ScanOutcome::Building { job_id }))
            }
            WorkerStatus::Aborting { .. } => Ok(Some(ScanOutcome::Busy {
                status: "aborting".into(),
            })),
            WorkerStatus::Aborted { .. } => {
                self.handle.clean().await?;
                if let Some(job) = ctx.job.as_mut() {
                    release_job(job, &mut ctx.worker);
                }
                tracing::warn!(worker = %self.name, job_id = %job_id, "Worker aborted job on its own, requeued");
                Ok(Some(ScanOutcome::Rescued {
                    job_id: Some(job_id),
                }))
            }
            WorkerStatus::Waiting { result, files, .. } => {
                let status = self.collect(ctx, job_id, result, files.into_keys().collect()).await?;
                Ok(Some(ScanOutcome::Collected { job_id, status }))
            }
            WorkerStatus::Idle => Ok(None),
        }
    }

    /// Handle a finished build.
    async fn collect(
        &mut self,
        ctx: &mut CycleContext,
        job_id: JobId,
        result: BuildResult,
        file_names: Vec<String>,
    ) -> Result<JobStatus, Failure> {
        let Some(mut job) = ctx.held_job().cloned() else {
            return Err(Failure::Scan(DispatchError::Internal(
                "collected job missing from cycle".into(),
            )));
        };

        match result {
            BuildResult::Ok => {
                let mut files = Vec::with_capacity(file_names.len());
                for name in file_names {
                    let contents = self.handle.fetch_file(&name).await?;
                    files.push((name, contents));
                }
                match self
                    .pipeline
                    .process_completed_output(&self.name, &job, files)
                    .await?
                {
                    UploadOutcome::Accepted => job.finish(JobStatus::Succeeded, None),
                    UploadOutcome::Rejected(reason) => {
                        tracing::warn!(worker = %self.name, job_id = %job_id, %reason, "Upload rejected");
                        job.finish(JobStatus::Failed, Some(reason))
                    }
                }
            }
            BuildResult::PackageFail | BuildResult::DepFail | BuildResult::ChrootFail => {
                job.finish(JobStatus::Failed, Some(result.to_string()));
            }
            BuildResult::GiveBack => job.reset(),
            BuildResult::BuilderFail => {
                return Err(Failure::Scan(DispatchError::BuilderFailure {
                    worker: self.name.clone(),
                    job_id,
                }));
            }
        }

        if let Err(e) = self.handle.clean().await {
            // The worker reports this job again next cycle, which the rescue
            // step cleans up once the store no longer assigns it.
            tracing::warn!(worker = %self.name, job_id = %job_id, error = %e, "Failed to clean worker");
        }

        let status = job.status;
        tracing::info!(worker = %self.name, job_id = %job_id, result = %result, status = %status, "Build collected");
        ctx.job = Some(job);
        ctx.worker.current_job = None;
        Ok(status)
    }

    async fn dispatch(&mut self, request: DispatchRequest) -> ScanOutcome {
        let job_id = request.job_id;
        if let Err(e) = self.handle.dispatch(&request).await {
            return self.scan_failed(Failure::Scan(e)).await;
        }
        if let Err(e) = self.clear_failures().await {
            // The worker is already building. The count is cleared by the
            // next successful dispatch instead.
            tracing::warn!(
                worker = %self.name,
                job_id = %job_id,
                error = %e,
                "Failed to clear worker failure count"
            );
        }
        tracing::info!(worker = %self.name, job_id = %job_id, "Job dispatched");
        ScanOutcome::Dispatched { job_id }
    }

    /// A successful dispatch clears the worker's failure count.
    async fn clear_failures(&self) -> Result<(), StoreError> {
        let mut txn = self.store.begin().await?;
        let mut worker = match txn.worker(&self.name).await {
            Ok(worker) => worker,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        if worker.failure_count == 0 {
            txn.abort().await;
            return Ok(());
        }
        worker.failure_count = 0;
        if let Err(e) = txn.put_worker(worker).await {
            txn.abort().await;
            return Err(e);
        }
        txn.commit().await
    }

    async fn scan_failed(&mut self, failure: Failure) -> ScanOutcome {
        let store = &*self.store;
        let handle = &*self.handle;
        let result = match &failure {
            Failure::Scan(e) => self.tracker.escalate(store, handle, &self.name, e).await,
            Failure::Abort(e) => self.tracker.abort_failed(store, handle, &self.name, e).await,
        };
        match result {
            Ok(escalation) => ScanOutcome::Escalated(escalation),
            Err(e) => {
                let (Failure::Scan(original) | Failure::Abort(original)) = &failure;
                tracing::error!(
                    worker = %self.name,
                    error = %e,
                    original = %original,
                    "Failed to record scan failure"
                );
                ScanOutcome::EscalationFailed {
                    error: e.to_string(),
                }
            }
        }
    }
}

fn finish_cancelled(ctx: &mut CycleContext) {
    if let Some(job) = ctx.held_job_mut() {
        job.finish(JobStatus::Cancelled, Some("cancelled".into()));
    }
    ctx.worker.current_job = None;
}
