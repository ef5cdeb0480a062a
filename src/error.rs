use thiserror::Error;
use uuid::Uuid;

/// Errors raised while scanning a worker. Every variant is recoverable at the
/// cycle boundary by escalation; none of them stop the manager.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker {worker} unreachable: {reason}")]
    WorkerUnreachable { worker: String, reason: String },

    #[error("Malformed response from worker {worker}: {reason}")]
    MalformedResponse { worker: String, reason: String },

    #[error("Worker {worker} violated protocol: {detail}")]
    ProtocolViolation { worker: String, detail: String },

    #[error("Cannot dispatch to worker {worker}: {reason}")]
    CannotDispatch { worker: String, reason: String },

    #[error("File {name} not found on worker {worker}")]
    FileNotFound { worker: String, name: String },

    #[error("Worker {worker} did not stop job {job_id} within {timeout_secs}s")]
    CancelTimeout {
        worker: String,
        job_id: Uuid,
        timeout_secs: u64,
    },

    #[error("Worker {worker} reported a builder failure for job {job_id}")]
    BuilderFailure { worker: String, job_id: Uuid },

    #[error("Upload processing failed for job {job_id}: {reason}")]
    Upload { job_id: Uuid, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// A worker speaking an unknown protocol is handled like a broken one,
    /// but logged at a higher level.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, DispatchError::ProtocolViolation { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DispatchError::WorkerUnreachable { .. } | DispatchError::MalformedResponse { .. }
        )
    }
}

/// Errors from the shared job/worker store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Transaction conflict on {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
