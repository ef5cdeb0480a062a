use serde::{Deserialize, Serialize};

use crate::farm::job::{Job, JobId};

/// What a worker is able to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub processors: Vec<String>,
    pub virtualized: bool,
}

impl Capabilities {
    pub fn matches(&self, job: &Job) -> bool {
        job.virtualized == self.virtualized && self.processors.iter().any(|p| p == &job.processor)
    }
}

/// A build machine as recorded in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    /// Base URL of the worker's RPC endpoint.
    pub url: String,
    pub processors: Vec<String>,
    #[serde(default)]
    pub virtualized: bool,
    #[serde(default = "default_ok")]
    pub ok: bool,
    /// Taken out of automatic dispatch by an operator.
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub failure_notes: Option<String>,
    #[serde(default)]
    pub current_job: Option<JobId>,
}

fn default_ok() -> bool {
    true
}

impl Worker {
    pub fn new(name: impl Into<String>, url: impl Into<String>, processors: &[&str]) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            processors: processors.iter().map(|p| p.to_string()).collect(),
            virtualized: false,
            ok: true,
            manual: false,
            failure_count: 0,
            failure_notes: None,
            current_job: None,
        }
    }

    pub fn with_virtualized(mut self, virtualized: bool) -> Self {
        self.virtualized = virtualized;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            processors: self.processors.clone(),
            virtualized: self.virtualized,
        }
    }

    /// Take the worker out of service until an operator re-enables it.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.ok = false;
        self.failure_notes = Some(reason.into());
    }

    pub fn reenable(&mut self) {
        self.ok = true;
        self.failure_count = 0;
        self.failure_notes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_match_processor_and_virtualization() {
        let worker = Worker::new("bob", "http://bob:8221", &["amd64", "i386"]);
        let caps = worker.capabilities();

        assert!(caps.matches(&Job::new("a", "i386", "c")));
        assert!(!caps.matches(&Job::new("a", "arm64", "c")));
        assert!(!caps.matches(&Job::new("a", "amd64", "c").with_virtualized(true)));
    }

    #[test]
    fn fail_then_reenable() {
        let mut worker = Worker::new("bob", "http://bob:8221", &["amd64"]);
        worker.failure_count = 15;
        worker.fail("too many failures");
        assert!(!worker.ok);
        assert_eq!(worker.failure_notes.as_deref(), Some("too many failures"));

        worker.reenable();
        assert!(worker.ok);
        assert_eq!(worker.failure_count, 0);
        assert!(worker.failure_notes.is_none());
    }

    #[test]
    fn seed_defaults_worker_to_ok() {
        let worker: Worker = serde_json::from_str(
            r#"{"name": "bob", "url": "http://bob:8221", "processors": ["amd64"]}"#,
        )
        .unwrap();
        assert!(worker.ok);
        assert!(!worker.manual);
        assert!(worker.current_job.is_none());
    }
}
