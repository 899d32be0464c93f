//! HTTP backend against a local mock job endpoint

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use capability_orchestrator::{
    backend::{BackendError, HttpBackend, InferenceBackend, InferenceRequest},
    core::{Capability, ServiceId},
};
use serde_json::{json, Map, Value};

/// How the mock job endpoint answers `/runsync`
#[derive(Clone, Copy)]
enum Mode {
    Completed,
    Bare,
    Failed,
    InProgress,
    Overloaded,
    Unprocessable,
    NotJson,
    Slow,
}

#[derive(Clone)]
struct MockState {
    mode: Mode,
    healthy: bool,
    calls: Arc<AtomicUsize>,
}

struct MockJobServer {
    url: String,
    calls: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockJobServer {
    async fn start(mode: Mode, healthy: bool) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            mode,
            healthy,
            calls: calls.clone(),
        };
        let app = Router::new()
            .route("/runsync", post(runsync_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            url: format!("http://{addr}"),
            calls,
            shutdown: Some(tx),
        }
    }

    fn backend(&self, api_key: Option<&str>, timeout: Duration) -> HttpBackend {
        HttpBackend::new(
            &self.url,
            "/runsync",
            "/health",
            api_key.map(str::to_string),
            timeout,
        )
        .unwrap()
    }
}

impl Drop for MockJobServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn runsync_handler(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let text = body["input"]["transcription"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer secret");

    match state.mode {
        Mode::Completed => Json(json!({
            "id": "job-1",
            "status": "COMPLETED",
            "output": {"summary": format!("summary of {text}"), "authorized": authorized}
        }))
        .into_response(),
        Mode::Bare => Json(json!({"summary": text})).into_response(),
        Mode::Failed => Json(json!({"status": "FAILED", "error": "model crashed"})).into_response(),
        Mode::InProgress => Json(json!({"id": "job-2", "status": "IN_PROGRESS"})).into_response(),
        Mode::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response(),
        Mode::Unprocessable => {
            (StatusCode::UNPROCESSABLE_ENTITY, "missing field").into_response()
        }
        Mode::NotJson => (StatusCode::OK, "<html>oops</html>").into_response(),
        Mode::Slow => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({"summary": text})).into_response()
        }
    }
}

async fn health_handler(State(state): State<MockState>) -> StatusCode {
    if state.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn request() -> InferenceRequest {
    let mut inputs = Map::new();
    inputs.insert("transcription".to_string(), json!("the visit"));
    InferenceRequest {
        service: ServiceId::new("phi4"),
        capability: Capability::new("summarize"),
        output: "summary".to_string(),
        inputs,
    }
}

#[tokio::test]
async fn test_completed_envelope() {
    let server = MockJobServer::start(Mode::Completed, true).await;
    let backend = server.backend(Some("secret"), Duration::from_secs(5));

    let payload = backend.invoke(request()).await.unwrap();
    assert_eq!(payload["summary"], "summary of the visit");
    assert_eq!(payload["authorized"], true);
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bare_payload() {
    let server = MockJobServer::start(Mode::Bare, true).await;
    let payload = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap();
    assert_eq!(payload["summary"], "the visit");
}

#[tokio::test]
async fn test_failed_job_is_rejected() {
    let server = MockJobServer::start(Mode::Failed, true).await;
    let err = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Rejected { .. }));
    assert!(err.to_string().contains("model crashed"));
    assert!(!err.is_transient());
    assert!(!err.allows_failover());
}

#[tokio::test]
async fn test_in_progress_job_is_transient() {
    let server = MockJobServer::start(Mode::InProgress, true).await;
    let err = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockJobServer::start(Mode::Overloaded, true).await;
    let err = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(503));
    assert!(err.is_transient());

    let server = MockJobServer::start(Mode::Unprocessable, true).await;
    let err = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(422));
    assert!(!err.is_transient());
    assert!(err.to_string().contains("missing field"));
}

#[tokio::test]
async fn test_invalid_json_is_malformed() {
    let server = MockJobServer::start(Mode::NotJson, true).await;
    let err = server
        .backend(None, Duration::from_secs(5))
        .invoke(request())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_client_timeout() {
    let server = MockJobServer::start(Mode::Slow, true).await;
    let err = server
        .backend(None, Duration::from_millis(100))
        .invoke(request())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Timeout { .. }));
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let backend = HttpBackend::new(
        &format!("http://127.0.0.1:{port}"),
        "/runsync",
        "/health",
        None,
        Duration::from_secs(1),
    )
    .unwrap();
    let err = backend.invoke(request()).await.unwrap_err();
    assert!(matches!(err, BackendError::Connection { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_health_probe() {
    let healthy = MockJobServer::start(Mode::Completed, true).await;
    assert!(healthy
        .backend(None, Duration::from_secs(5))
        .health_check()
        .await
        .is_ok());

    let sick = MockJobServer::start(Mode::Completed, false).await;
    let err = sick
        .backend(None, Duration::from_secs(5))
        .health_check()
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(503));
}
