use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::farm::{Job, JobId, Worker};

/// How a finished build ended, as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Ok,
    PackageFail,
    DepFail,
    ChrootFail,
    /// The worker itself broke while building.
    BuilderFail,
    /// The worker hands the job back untouched.
    GiveBack,
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildResult::Ok => write!(f, "ok"),
            BuildResult::PackageFail => write!(f, "package_fail"),
            BuildResult::DepFail => write!(f, "dep_fail"),
            BuildResult::ChrootFail => write!(f, "chroot_fail"),
            BuildResult::BuilderFail => write!(f, "builder_fail"),
            BuildResult::GiveBack => write!(f, "give_back"),
        }
    }
}

/// Status reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Building {
        job_id: JobId,
        log_tail: Option<String>,
    },
    /// Finished; output files are waiting to be collected.
    Waiting {
        job_id: JobId,
        result: BuildResult,
        files: BTreeMap<String, String>,
    },
    Aborting {
        job_id: JobId,
    },
    Aborted {
        job_id: JobId,
    },
}

impl WorkerStatus {
    /// Job the worker believes it holds, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerStatus::Idle => None,
            WorkerStatus::Building { job_id, .. }
            | WorkerStatus::Waiting { job_id, .. }
            | WorkerStatus::Aborting { job_id }
            | WorkerStatus::Aborted { job_id } => Some(*job_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WorkerStatus::Idle)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Building { .. } => "building",
            WorkerStatus::Waiting { .. } => "waiting",
            WorkerStatus::Aborting { .. } => "aborting",
            WorkerStatus::Aborted { .. } => "aborted",
        }
    }
}

/// Everything a worker needs to start a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: JobId,
    pub chroot: String,
    pub files: BTreeMap<String, String>,
    pub args: BTreeMap<String, String>,
}

impl From<&Job> for DispatchRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            chroot: job.chroot.clone(),
            files: job.files.clone(),
            args: job.args.clone(),
        }
    }
}

/// Client for one remote build worker.
///
/// Implementations bound every call by an RPC timeout and report transport
/// failures as [`DispatchError::WorkerUnreachable`].
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> Result<WorkerStatus>;

    /// Start a job. Fails with [`DispatchError::CannotDispatch`] if the
    /// worker is busy or lacks the chroot or input files.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<()>;

    /// Ask the worker to stop its current job. Repeated calls are harmless.
    async fn request_abort(&self) -> Result<()>;

    /// Discard the finished or aborted job's state and return to idle.
    async fn clean(&self) -> Result<()>;

    /// Try to recycle the worker to a clean state. `Ok(false)` means it
    /// cannot be recycled and must be failed.
    async fn reset_or_fail(&self) -> Result<bool>;

    async fn fetch_file(&self, name: &str) -> Result<Vec<u8>>;
}

/// Builds a [`WorkerHandle`] for a worker record.
pub trait WorkerConnector: Send + Sync + 'static {
    fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerHandle>>;
}

impl DispatchError {
    pub(crate) fn unreachable(worker: &str, reason: impl std::fmt::Display) -> Self {
        DispatchError::WorkerUnreachable {
            worker: worker.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn job_id_of_each_status() {
        let id = Uuid::new_v4();
        assert_eq!(WorkerStatus::Idle.job_id(), None);
        assert_eq!(
            WorkerStatus::Building {
                job_id: id,
                log_tail: None
            }
            .job_id(),
            Some(id)
        );
        assert_eq!(WorkerStatus::Aborted { job_id: id }.job_id(), Some(id));
    }

    #[test]
    fn dispatch_request_from_job() {
        let job = Job::new("hello", "amd64", "noble-amd64")
            .with_file("hello.dsc", "sha256:abc")
            .with_arg("arch_indep", "true");
        let request = DispatchRequest::from(&job);

        assert_eq!(request.job_id, job.id);
        assert_eq!(request.chroot, "noble-amd64");
        assert_eq!(request.files.get("hello.dsc").map(String::as_str), Some("sha256:abc"));
        assert_eq!(request.args.len(), 1);
    }
}
