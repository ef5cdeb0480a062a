//! HttpWorkerClient against an in-process axum worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use buildd_lite::error::DispatchError;
use buildd_lite::farm::Job;
use buildd_lite::worker::{
    BuildResult, DispatchRequest, HttpWorkerClient, WorkerHandle, WorkerStatus,
};
use tokio::net::TcpListener;
use uuid::Uuid;

struct FakeServer {
    status: Mutex<(StatusCode, String)>,
    dispatched: Mutex<Vec<serde_json::Value>>,
    busy: AtomicBool,
    aborts: AtomicUsize,
    resets: AtomicUsize,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new((StatusCode::OK, r#"{"state":"idle"}"#.to_string())),
            dispatched: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
            aborts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }

    fn respond(&self, code: StatusCode, body: impl Into<String>) {
        *self.status.lock().unwrap() = (code, body.into());
    }
}

async fn status_handler(State(server): State<Arc<FakeServer>>) -> impl IntoResponse {
    server.status.lock().unwrap().clone()
}

async fn dispatch_handler(
    State(server): State<Arc<FakeServer>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    if server.busy.load(Ordering::SeqCst) {
        return (StatusCode::CONFLICT, "already building");
    }
    server.dispatched.lock().unwrap().push(body);
    (StatusCode::OK, "")
}

async fn abort_handler(State(server): State<Arc<FakeServer>>) -> StatusCode {
    server.aborts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn reset_handler(State(server): State<Arc<FakeServer>>) -> StatusCode {
    server.resets.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn file_handler(Path(name): Path<String>) -> impl IntoResponse {
    if name == "hello world.deb" {
        (StatusCode::OK, b"debian binary".to_vec())
    } else {
        (StatusCode::NOT_FOUND, Vec::new())
    }
}

async fn slow_status_handler() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    r#"{"state":"idle"}"#
}

/// Serve the fake worker and return its RPC base URL.
async fn spawn_server(server: Arc<FakeServer>) -> String {
    let app = Router::new()
        .route("/rpc/status", get(status_handler))
        .route("/rpc/dispatch", post(dispatch_handler))
        .route("/rpc/abort", post(abort_handler))
        .route("/rpc/clean", post(|| async { StatusCode::OK }))
        .route("/rpc/reset", post(reset_handler))
        .route("/rpc/files/{name}", get(file_handler))
        .route("/slow/status", get(slow_status_handler))
        .with_state(server);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/rpc", addr)
}

fn client(base: &str, virtualized: bool) -> HttpWorkerClient {
    HttpWorkerClient::new("bob", base, virtualized, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_status_is_decoded() {
    let server = FakeServer::new();
    let base = spawn_server(server.clone()).await;
    let client = client(&base, false);

    assert_eq!(client.status().await.unwrap(), WorkerStatus::Idle);

    let job_id = Uuid::new_v4();
    server.respond(
        StatusCode::OK,
        serde_json::json!({"state": "building", "job_id": job_id, "log_tail": "make[1]"})
            .to_string(),
    );
    assert_eq!(
        client.status().await.unwrap(),
        WorkerStatus::Building {
            job_id,
            log_tail: Some("make[1]".into())
        }
    );

    server.respond(
        StatusCode::OK,
        serde_json::json!({
            "state": "waiting",
            "job_id": job_id,
            "result": "dep_fail",
            "files": {"buildlog": "sha256:aa"}
        })
        .to_string(),
    );
    match client.status().await.unwrap() {
        WorkerStatus::Waiting { result, files, .. } => {
            assert_eq!(result, BuildResult::DepFail);
            assert_eq!(files.len(), 1);
        }
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_state_is_protocol_violation() {
    let server = FakeServer::new();
    server.respond(StatusCode::OK, r#"{"state":"paused"}"#);
    let base = spawn_server(server).await;

    let err = client(&base, false).status().await.unwrap_err();
    assert!(err.is_protocol_violation(), "got {:?}", err);
}

#[tokio::test]
async fn test_garbage_body_is_malformed_response() {
    let server = FakeServer::new();
    server.respond(StatusCode::OK, "<html>not json</html>");
    let base = spawn_server(server).await;

    let err = client(&base, false).status().await.unwrap_err();
    assert!(matches!(err, DispatchError::MalformedResponse { .. }), "got {:?}", err);
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let server = FakeServer::new();
    server.respond(StatusCode::INTERNAL_SERVER_ERROR, "boom");
    let base = spawn_server(server).await;

    let err = client(&base, false).status().await.unwrap_err();
    assert!(matches!(err, DispatchError::WorkerUnreachable { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}/rpc", addr), false)
        .status()
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::WorkerUnreachable { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_slow_worker_times_out() {
    let server = FakeServer::new();
    let base = spawn_server(server).await;
    let slow = base.replace("/rpc", "/slow");
    let client = HttpWorkerClient::new("bob", &slow, false, Duration::from_millis(200)).unwrap();

    let err = client.status().await.unwrap_err();
    assert!(matches!(err, DispatchError::WorkerUnreachable { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_dispatch_posts_job() {
    let server = FakeServer::new();
    let base = spawn_server(server.clone()).await;
    let job = Job::new("hello", "amd64", "noble-amd64").with_file("hello.dsc", "sha256:00");

    client(&base, false)
        .dispatch(&DispatchRequest::from(&job))
        .await
        .unwrap();

    let dispatched = server.dispatched.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0]["job_id"], job.id.to_string());
    assert_eq!(dispatched[0]["chroot"], "noble-amd64");
    assert_eq!(dispatched[0]["files"]["hello.dsc"], "sha256:00");
}

#[tokio::test]
async fn test_busy_worker_refuses_dispatch() {
    let server = FakeServer::new();
    server.busy.store(true, Ordering::SeqCst);
    let base = spawn_server(server).await;
    let job = Job::new("hello", "amd64", "noble-amd64");

    let err = client(&base, false)
        .dispatch(&DispatchRequest::from(&job))
        .await
        .unwrap_err();
    match err {
        DispatchError::CannotDispatch { reason, .. } => assert_eq!(reason, "already building"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_abort_can_be_repeated() {
    let server = FakeServer::new();
    let base = spawn_server(server.clone()).await;
    let client = client(&base, false);

    client.request_abort().await.unwrap();
    client.request_abort().await.unwrap();
    client.clean().await.unwrap();
    assert_eq!(server.aborts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fetch_file() {
    let server = FakeServer::new();
    let base = spawn_server(server).await;
    let client = client(&base, false);

    assert_eq!(
        client.fetch_file("hello world.deb").await.unwrap(),
        b"debian binary"
    );
    let err = client.fetch_file("missing.deb").await.unwrap_err();
    assert!(matches!(err, DispatchError::FileNotFound { ref name, .. } if name == "missing.deb"));
}

#[tokio::test]
async fn test_only_virtualized_workers_reset() {
    let server = FakeServer::new();
    let base = spawn_server(server.clone()).await;

    assert!(!client(&base, false).reset_or_fail().await.unwrap());
    assert_eq!(server.resets.load(Ordering::SeqCst), 0);

    assert!(client(&base, true).reset_or_fail().await.unwrap());
    assert_eq!(server.resets.load(Ordering::SeqCst), 1);
}
