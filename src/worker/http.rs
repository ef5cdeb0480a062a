use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::error::{DispatchError, Result};
use crate::farm::{JobId, Worker};
use crate::worker::handle::{
    BuildResult, DispatchRequest, WorkerConnector, WorkerHandle, WorkerStatus,
};

/// Status body as sent by the worker, before validation.
#[derive(Debug, Deserialize)]
struct WireStatus {
    state: String,
    #[serde(default)]
    job_id: Option<JobId>,
    #[serde(default)]
    log_tail: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

fn parse_result(raw: &str) -> Option<BuildResult> {
    match raw {
        "ok" => Some(BuildResult::Ok),
        "package_fail" => Some(BuildResult::PackageFail),
        "dep_fail" => Some(BuildResult::DepFail),
        "chroot_fail" => Some(BuildResult::ChrootFail),
        "builder_fail" => Some(BuildResult::BuilderFail),
        "give_back" => Some(BuildResult::GiveBack),
        _ => None,
    }
}

fn decode_status(worker: &str, wire: WireStatus) -> Result<WorkerStatus> {
    let violation = |detail: String| DispatchError::ProtocolViolation {
        worker: worker.to_string(),
        detail,
    };
    let job_id = |state: &str| {
        wire.job_id
            .ok_or_else(|| violation(format!("state {} without job_id", state)))
    };

    match wire.state.as_str() {
        "idle" => Ok(WorkerStatus::Idle),
        "building" => Ok(WorkerStatus::Building {
            job_id: job_id("building")?,
            log_tail: wire.log_tail.clone(),
        }),
        "waiting" => {
            let job_id = job_id("waiting")?;
            let raw = wire
                .result
                .as_deref()
                .ok_or_else(|| violation("state waiting without result".into()))?;
            let result =
                parse_result(raw).ok_or_else(|| violation(format!("unknown result {}", raw)))?;
            Ok(WorkerStatus::Waiting {
                job_id,
                result,
                files: wire.files.clone(),
            })
        }
        "aborting" => Ok(WorkerStatus::Aborting {
            job_id: job_id("aborting")?,
        }),
        "aborted" => Ok(WorkerStatus::Aborted {
            job_id: job_id("aborted")?,
        }),
        other => Err(violation(format!("unknown state {}", other))),
    }
}

/// JSON-over-HTTP client for a build worker.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    name: String,
    base_url: Url,
    virtualized: bool,
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        virtualized: bool,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = Url::parse(base_url)
            .map_err(|e| DispatchError::Internal(format!("bad url for {}: {}", name, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DispatchError::Internal(format!(
                "bad url for {}: {}",
                name, base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| DispatchError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            name,
            base_url,
            virtualized,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| DispatchError::unreachable(&self.name, e))
    }

    fn expect_success(&self, response: &reqwest::Response) -> Result<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DispatchError::unreachable(
                &self.name,
                format!("HTTP {}", response.status()),
            ))
        }
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let response = self.send(self.client.post(self.url(&[path]))).await?;
        self.expect_success(&response)
    }
}

#[async_trait]
impl WorkerHandle for HttpWorkerClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> Result<WorkerStatus> {
        let response = self.send(self.client.get(self.url(&["status"]))).await?;
        self.expect_success(&response)?;
        let wire: WireStatus =
            response
                .json()
                .await
                .map_err(|e| DispatchError::MalformedResponse {
                    worker: self.name.clone(),
                    reason: e.to_string(),
                })?;
        decode_status(&self.name, wire)
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        let response = self
            .send(self.client.post(self.url(&["dispatch"])).json(request))
            .await?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                let reason = response.text().await.unwrap_or_default();
                Err(DispatchError::CannotDispatch {
                    worker: self.name.clone(),
                    reason,
                })
            }
            _ => self.expect_success(&response),
        }
    }

    async fn request_abort(&self) -> Result<()> {
        self.post_empty("abort").await
    }

    async fn clean(&self) -> Result<()> {
        self.post_empty("clean").await
    }

    async fn reset_or_fail(&self) -> Result<bool> {
        if !self.virtualized {
            tracing::info!(worker = %self.name, "Worker is not virtualized, cannot reset");
            return Ok(false);
        }
        self.post_empty("reset").await?;
        tracing::info!(worker = %self.name, "Worker reset requested");
        Ok(true)
    }

    async fn fetch_file(&self, name: &str) -> Result<Vec<u8>> {
        let response = self
            .send(self.client.get(self.url(&["files", name])))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DispatchError::FileNotFound {
                worker: self.name.clone(),
                name: name.to_string(),
            });
        }
        self.expect_success(&response)?;
        let body = response
            .bytes()
            .await
            .map_err(|e| DispatchError::unreachable(&self.name, e))?;
        Ok(body.to_vec())
    }
}

/// Connects to workers through [`HttpWorkerClient`].
#[derive(Debug, Clone)]
pub struct HttpConnector {
    rpc_timeout: Duration,
}

impl HttpConnector {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

impl WorkerConnector for HttpConnector {
    fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerHandle>> {
        let client = HttpWorkerClient::new(
            worker.name.clone(),
            &worker.url,
            worker.virtualized,
            self.rpc_timeout,
        )?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn wire(json: serde_json::Value) -> WireStatus {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn decodes_waiting_status() {
        let id = Uuid::new_v4();
        let status = decode_status(
            "bob",
            wire(serde_json::json!({
                "state": "waiting",
                "job_id": id,
                "result": "ok",
                "files": {"hello.deb": "sha1:00"}
            })),
        )
        .unwrap();

        match status {
            WorkerStatus::Waiting { job_id, result, files } => {
                assert_eq!(job_id, id);
                assert_eq!(result, BuildResult::Ok);
                assert!(files.contains_key("hello.deb"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn unknown_state_is_protocol_violation() {
        let err = decode_status("bob", wire(serde_json::json!({"state": "dancing"}))).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn building_without_job_is_protocol_violation() {
        let err =
            decode_status("bob", wire(serde_json::json!({"state": "building"}))).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn unknown_result_is_protocol_violation() {
        let err = decode_status(
            "bob",
            wire(serde_json::json!({
                "state": "waiting",
                "job_id": Uuid::new_v4(),
                "result": "exploded"
            })),
        )
        .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn urls_are_joined_and_escaped() {
        let client =
            HttpWorkerClient::new("bob", "http://bob:8221/rpc/", false, Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.url(&["status"]).as_str(), "http://bob:8221/rpc/status");
        assert_eq!(
            client.url(&["files", "a b.deb"]).as_str(),
            "http://bob:8221/rpc/files/a%20b.deb"
        );
    }

    #[test]
    fn rejects_unusable_url() {
        assert!(HttpWorkerClient::new("bob", "not a url", false, Duration::from_secs(1)).is_err());
    }
}
