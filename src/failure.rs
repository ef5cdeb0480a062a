//! Blame assignment after a failed scan.
//!
//! Both the worker and its current job carry failure counters, and both are
//! bumped when a cycle fails. Comparing the two decides who is at fault: a
//! worker that fails once per job looks exactly like an unlucky job, so blame
//! is deferred until the counts diverge.

use serde::Serialize;

use crate::config::Thresholds;
use crate::error::{DispatchError, Result, StoreError};
use crate::farm::{Job, JobId, JobStatus, Worker};
use crate::store::{load_current_job, FarmStore, Transaction};
use crate::worker::WorkerHandle;

/// What happens to a suspect worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    Keep,
    /// Try `reset_or_fail`; the worker is failed if the reset is refused.
    Recycle,
    /// Take the worker out of service until an operator re-enables it.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    /// Counts are level. Retry the job without judging the worker.
    RetryJob,
    WorkerSuspect { reset_job: bool, action: WorkerAction },
    /// The job fails terminally and the worker's count is cleared.
    JobSuspect,
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remediation::RetryJob => write!(f, "retry_job"),
            Remediation::WorkerSuspect { action, .. } => match action {
                WorkerAction::Keep => write!(f, "worker_suspect"),
                WorkerAction::Recycle => write!(f, "worker_recycle"),
                WorkerAction::Fail => write!(f, "worker_fail"),
            },
            Remediation::JobSuspect => write!(f, "job_fail"),
        }
    }
}

/// Decide a remediation from the current counters. `job_failures` is `None`
/// when the worker holds no job.
pub fn assess(
    worker_failures: u32,
    job_failures: Option<u32>,
    thresholds: &Thresholds,
) -> Remediation {
    match job_failures {
        Some(job) if job == worker_failures => Remediation::RetryJob,
        Some(job) if job > worker_failures => Remediation::JobSuspect,
        _ => Remediation::WorkerSuspect {
            reset_job: job_failures.is_some(),
            action: worker_action(worker_failures, thresholds),
        },
    }
}

/// A zero threshold disables that step.
fn worker_action(failures: u32, thresholds: &Thresholds) -> WorkerAction {
    let fail_at = thresholds.fail_threshold();
    if fail_at > 0 && failures >= fail_at {
        WorkerAction::Fail
    } else if failures > 0 && failures.checked_rem(thresholds.reset_threshold) == Some(0) {
        WorkerAction::Recycle
    } else {
        WorkerAction::Keep
    }
}

/// Result of one escalation, for logging and scan reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub remediation: Remediation,
    pub job_id: Option<JobId>,
    pub worker_failures: u32,
    pub job_failures: Option<u32>,
    /// The worker ended up failed, either by decision or by a refused reset.
    pub worker_failed: bool,
}

/// Applies [`assess`] against the store.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    thresholds: Thresholds,
}

impl FailureTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Record a scan failure and remediate it in a fresh transaction. The
    /// failed cycle's own transaction must already be aborted.
    pub async fn escalate(
        &self,
        store: &dyn FarmStore,
        handle: &dyn WorkerHandle,
        worker: &str,
        error: &DispatchError,
    ) -> Result<Escalation> {
        let mut txn = store.begin().await?;
        match self.escalate_in(txn.as_mut(), handle, worker, error).await {
            Ok(escalation) => {
                txn.commit().await?;
                Ok(escalation)
            }
            Err(e) => {
                txn.abort().await;
                Err(e)
            }
        }
    }

    async fn escalate_in(
        &self,
        txn: &mut dyn Transaction,
        handle: &dyn WorkerHandle,
        name: &str,
        error: &DispatchError,
    ) -> Result<Escalation> {
        let mut worker = txn.worker(name).await?;
        let mut job = load_current_job(txn, &mut worker).await?;

        worker.failure_count = worker.failure_count.saturating_add(1);
        if let Some(job) = job.as_mut() {
            job.failure_count = job.failure_count.saturating_add(1);
        }
        let job_failures = job.as_ref().map(|j| j.failure_count);
        let remediation = assess(worker.failure_count, job_failures, &self.thresholds);
        let reason = error.to_string();

        let escalation = Escalation {
            remediation,
            job_id: job.as_ref().map(|j| j.id),
            worker_failures: worker.failure_count,
            job_failures,
            worker_failed: false,
        };

        if error.is_protocol_violation() {
            tracing::error!(
                worker = name,
                job_id = ?escalation.job_id,
                worker_failures = worker.failure_count,
                job_failures = ?job_failures,
                remediation = %remediation,
                error = %error,
                "Worker protocol violation"
            );
        } else {
            tracing::warn!(
                worker = name,
                job_id = ?escalation.job_id,
                worker_failures = worker.failure_count,
                job_failures = ?job_failures,
                remediation = %remediation,
                error = %error,
                "Scan failure assessed"
            );
        }

        match remediation {
            Remediation::RetryJob => {
                if let Some(job) = job.as_mut() {
                    release_job(job, &mut worker);
                }
            }
            Remediation::WorkerSuspect { reset_job, action } => {
                if reset_job {
                    if let Some(job) = job.as_mut() {
                        release_job(job, &mut worker);
                    }
                }
                match action {
                    WorkerAction::Keep => {}
                    WorkerAction::Fail => fail_worker(&mut worker, &reason),
                    WorkerAction::Recycle => recycle(handle, &mut worker, &reason).await,
                }
            }
            Remediation::JobSuspect => {
                worker.failure_count = 0;
                if let Some(job) = job.as_mut() {
                    job.finish(JobStatus::Failed, Some(reason.clone()));
                    worker.current_job = None;
                }
                if let Err(e) = handle.clean().await {
                    tracing::warn!(worker = name, error = %e, "Failed to clean worker after job failure");
                }
            }
        }

        let worker_failed = !worker.ok;
        txn.put_worker(worker).await?;
        if let Some(job) = job {
            txn.put_job(job).await?;
        }
        Ok(Escalation {
            worker_failed,
            ..escalation
        })
    }

    /// The abort RPC for a cancelling job failed. The worker is blamed
    /// outright: the job is released and the worker recycled or failed.
    pub async fn abort_failed(
        &self,
        store: &dyn FarmStore,
        handle: &dyn WorkerHandle,
        name: &str,
        error: &DispatchError,
    ) -> Result<Escalation> {
        let mut txn = store.begin().await?;
        let mut worker = match txn.worker(name).await {
            Ok(worker) => worker,
            Err(e) => {
                txn.abort().await;
                return Err(e.into());
            }
        };
        let mut job = match load_current_job(txn.as_mut(), &mut worker).await {
            Ok(job) => job,
            Err(e) => {
                txn.abort().await;
                return Err(e.into());
            }
        };

        worker.failure_count = worker.failure_count.saturating_add(1);
        let job_id = job.as_ref().map(|j| j.id);
        if let Some(job) = job.as_mut() {
            release_job(job, &mut worker);
        }
        tracing::warn!(
            worker = name,
            job_id = ?job_id,
            worker_failures = worker.failure_count,
            error = %error,
            "Abort request failed, recycling worker"
        );
        let reason = error.to_string();
        recycle(handle, &mut worker, &reason).await;

        let escalation = Escalation {
            remediation: Remediation::WorkerSuspect {
                reset_job: job_id.is_some(),
                action: if worker.ok {
                    WorkerAction::Recycle
                } else {
                    WorkerAction::Fail
                },
            },
            job_id,
            worker_failures: worker.failure_count,
            job_failures: job.as_ref().map(|j| j.failure_count),
            worker_failed: !worker.ok,
        };

        let staged = async {
            txn.put_worker(worker).await?;
            if let Some(job) = job {
                txn.put_job(job).await?;
            }
            Ok::<(), StoreError>(())
        }
        .await;
        match staged {
            Ok(()) => txn.commit().await?,
            Err(e) => {
                txn.abort().await;
                return Err(e.into());
            }
        }
        Ok(escalation)
    }
}

/// Free the worker's slot. A job that was being cancelled is finished as
/// cancelled rather than requeued.
pub(crate) fn release_job(job: &mut Job, worker: &mut Worker) {
    if job.status == JobStatus::Cancelling {
        job.finish(JobStatus::Cancelled, Some("cancelled".into()));
    } else {
        job.reset();
    }
    worker.current_job = None;
}

fn fail_worker(worker: &mut Worker, reason: &str) {
    tracing::error!(
        worker = %worker.name,
        failures = worker.failure_count,
        reason,
        "Worker failed permanently"
    );
    worker.fail(reason);
}

async fn recycle(handle: &dyn WorkerHandle, worker: &mut Worker, reason: &str) {
    match handle.reset_or_fail().await {
        Ok(true) => {
            tracing::info!(worker = %worker.name, failures = worker.failure_count, "Worker recycled");
        }
        Ok(false) => fail_worker(worker, reason),
        Err(e) => fail_worker(worker, &format!("{}; reset failed: {}", reason, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Thresholds = Thresholds {
        reset_threshold: 3,
        reset_failure_multiplier: 5,
    };

    #[test]
    fn level_counts_retry_the_job() {
        assert_eq!(assess(1, Some(1), &T), Remediation::RetryJob);
        assert_eq!(assess(7, Some(7), &T), Remediation::RetryJob);
    }

    #[test]
    fn higher_job_count_blames_the_job() {
        assert_eq!(assess(3, Some(6), &T), Remediation::JobSuspect);
    }

    #[test]
    fn higher_worker_count_blames_the_worker() {
        assert_eq!(
            assess(2, Some(1), &T),
            Remediation::WorkerSuspect {
                reset_job: true,
                action: WorkerAction::Keep
            }
        );
        assert_eq!(
            assess(3, Some(1), &T),
            Remediation::WorkerSuspect {
                reset_job: true,
                action: WorkerAction::Recycle
            }
        );
        assert_eq!(
            assess(6, None, &T),
            Remediation::WorkerSuspect {
                reset_job: false,
                action: WorkerAction::Recycle
            }
        );
    }

    #[test]
    fn fail_threshold_wins_over_recycle() {
        // 15 is both a multiple of 3 and the fail threshold.
        assert_eq!(
            assess(15, None, &T),
            Remediation::WorkerSuspect {
                reset_job: false,
                action: WorkerAction::Fail
            }
        );
        assert_eq!(
            assess(17, Some(1), &T),
            Remediation::WorkerSuspect {
                reset_job: true,
                action: WorkerAction::Fail
            }
        );
    }

    #[test]
    fn zero_thresholds_keep_the_worker() {
        let zero = Thresholds {
            reset_threshold: 0,
            reset_failure_multiplier: 5,
        };
        for failures in [0, 1, 3, 15] {
            assert_eq!(worker_action(failures, &zero), WorkerAction::Keep);
        }

        let no_fail = Thresholds {
            reset_threshold: 3,
            reset_failure_multiplier: 0,
        };
        assert_eq!(worker_action(3, &no_fail), WorkerAction::Recycle);
        assert_eq!(worker_action(4, &no_fail), WorkerAction::Keep);
    }

    #[test]
    fn no_job_is_never_ambiguous() {
        assert!(matches!(
            assess(0, None, &T),
            Remediation::WorkerSuspect {
                reset_job: false,
                action: WorkerAction::Keep
            }
        ));
    }

    #[test]
    fn decision_is_deterministic() {
        for w in 0..40 {
            for j in [None, Some(0), Some(3), Some(20)] {
                assert_eq!(assess(w, j, &T), assess(w, j, &T));
            }
        }
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = Thresholds {
            reset_threshold: 1,
            reset_failure_multiplier: 2,
        };
        assert_eq!(
            assess(1, None, &strict),
            Remediation::WorkerSuspect {
                reset_job: false,
                action: WorkerAction::Recycle
            }
        );
        assert_eq!(
            assess(2, None, &strict),
            Remediation::WorkerSuspect {
                reset_job: false,
                action: WorkerAction::Fail
            }
        );
    }

    #[test]
    fn release_cancelling_job_finishes_it() {
        let mut worker = Worker::new("bob", "http://bob", &["amd64"]);
        let mut job = Job::new("hello", "amd64", "c");
        job.start("bob");
        job.status = JobStatus::Cancelling;
        worker.current_job = Some(job.id);

        release_job(&mut job, &mut worker);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(worker.current_job.is_none());

        let mut job = Job::new("hello", "amd64", "c");
        job.start("bob");
        release_job(&mut job, &mut worker);
        assert_eq!(job.status, JobStatus::Pending);
    }
}
