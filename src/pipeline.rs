use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{DispatchError, Result};
use crate::farm::Job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    Rejected(String),
}

/// Consumer of completed build output.
#[async_trait]
pub trait UploadPipeline: Send + Sync + 'static {
    /// Process the files collected from `worker` for `job`. An `Err` means
    /// the pipeline itself failed; a rejected upload is `Ok(Rejected)`.
    async fn process_completed_output(
        &self,
        worker: &str,
        job: &Job,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<UploadOutcome>;
}

/// Drops each job's output into `<root>/<job_id>/`.
///
/// Files are written to `<job_id>.partial` first and the directory renamed
/// once complete, so a reader never sees a half-written upload.
#[derive(Debug, Clone)]
pub struct DirectoryPipeline {
    root: PathBuf,
}

impl DirectoryPipeline {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn upload_dir(&self, job: &Job) -> PathBuf {
        self.root.join(job.id.to_string())
    }

    fn valid_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\')
            && !name.contains('\0')
    }

    async fn write_all(&self, staging: &Path, files: &[(String, Vec<u8>)]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(staging).await?;
        for (name, contents) in files {
            tokio::fs::write(staging.join(name), contents).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadPipeline for DirectoryPipeline {
    async fn process_completed_output(
        &self,
        worker: &str,
        job: &Job,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<UploadOutcome> {
        if let Some((bad, _)) = files.iter().find(|(name, _)| !Self::valid_name(name)) {
            tracing::warn!(worker, job_id = %job.id, file = %bad, "Rejecting upload with unsafe file name");
            return Ok(UploadOutcome::Rejected(format!("unsafe file name {:?}", bad)));
        }

        let target = self.upload_dir(job);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tracing::info!(worker, job_id = %job.id, "Upload already present, accepting again");
            return Ok(UploadOutcome::Accepted);
        }
        let staging = self.root.join(format!("{}.partial", job.id));
        let io_error = |e: std::io::Error| DispatchError::Upload {
            job_id: job.id,
            reason: e.to_string(),
        };

        if let Err(e) = self.write_all(&staging, &files).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(io_error(e));
        }
        tokio::fs::rename(&staging, &target).await.map_err(io_error)?;

        tracing::info!(
            worker,
            job_id = %job.id,
            files = files.len(),
            dir = %target.display(),
            "Upload accepted"
        );
        Ok(UploadOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_files_into_job_directory() {
        let dir = TempDir::new().unwrap();
        let pipeline = DirectoryPipeline::new(dir.path());
        let job = Job::new("hello", "amd64", "c");

        let outcome = pipeline
            .process_completed_output(
                "bob",
                &job,
                vec![
                    ("hello.deb".into(), b"deb".to_vec()),
                    ("buildlog".into(), b"log".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome, UploadOutcome::Accepted);
        let target = pipeline.upload_dir(&job);
        assert_eq!(std::fs::read(target.join("hello.deb")).unwrap(), b"deb");
        assert_eq!(std::fs::read(target.join("buildlog")).unwrap(), b"log");
        assert!(!dir.path().join(format!("{}.partial", job.id)).exists());
    }

    #[tokio::test]
    async fn redelivery_is_accepted() {
        let dir = TempDir::new().unwrap();
        let pipeline = DirectoryPipeline::new(dir.path());
        let job = Job::new("hello", "amd64", "c");
        let files = vec![("hello.deb".to_string(), b"deb".to_vec())];

        for _ in 0..2 {
            let outcome = pipeline
                .process_completed_output("bob", &job, files.clone())
                .await
                .unwrap();
            assert_eq!(outcome, UploadOutcome::Accepted);
        }
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let pipeline = DirectoryPipeline::new(dir.path());
        let job = Job::new("hello", "amd64", "c");

        let outcome = pipeline
            .process_completed_output("bob", &job, vec![("../evil".into(), vec![1])])
            .await
            .unwrap();

        assert!(matches!(outcome, UploadOutcome::Rejected(_)));
        assert!(!pipeline.upload_dir(&job).exists());
    }

    #[tokio::test]
    async fn unwritable_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let pipeline = DirectoryPipeline::new(&blocker);
        let job = Job::new("hello", "amd64", "c");

        let err = pipeline
            .process_completed_output("bob", &job, vec![("a.deb".into(), vec![1])])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Upload { .. }));
    }
}
