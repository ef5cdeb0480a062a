use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Succeeded | JobStatus::Failed
        )
    }

    /// Statuses that occupy a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Cancelling)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Cancelling => write!(f, "cancelling"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A queued unit of work, such as one package build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub id: JobId,
    pub name: String,
    /// Architecture tag a worker must offer to take this job.
    pub processor: String,
    #[serde(default)]
    pub virtualized: bool,
    /// Chroot the worker unpacks before building.
    pub chroot: String,
    /// Input files the worker must fetch, by file name.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub built_by: Option<String>,
    #[serde(default)]
    pub log_tail: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        processor: impl Into<String>,
        chroot: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            processor: processor.into(),
            virtualized: false,
            chroot: chroot.into(),
            files: BTreeMap::new(),
            args: BTreeMap::new(),
            priority: 0,
            status: JobStatus::Pending,
            failure_count: 0,
            assigned_worker: None,
            built_by: None,
            log_tail: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_virtualized(mut self, virtualized: bool) -> Self {
        self.virtualized = virtualized;
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(name.into(), source.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn start(&mut self, worker: &str) {
        self.status = JobStatus::Running;
        self.assigned_worker = Some(worker.to_string());
        self.built_by = Some(worker.to_string());
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.log_tail = None;
    }

    /// Return the job to the queue so any worker may pick it up again.
    /// The failure count is kept.
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.assigned_worker = None;
        self.started_at = None;
        self.log_tail = None;
    }

    /// Move to a terminal status and release the worker slot.
    pub fn finish(&mut self, status: JobStatus, reason: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.assigned_worker = None;
        self.failure_reason = reason;
        self.finished_at = Some(Utc::now());
    }
}
