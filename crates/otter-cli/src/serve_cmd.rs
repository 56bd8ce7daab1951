use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use otter_core::memory::MemoryStats;
use otter_core::metrics::MetricsSnapshot;
use otter_core::model::{TaskEvent, TaskRequest, TaskRun, TaskState, Template};
use otter_core::{AdmissionError, Engine};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "detail": self.detail });
        (self.status, Json(body)).into_response()
    }
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        // Both admission rejections are caller errors, not server faults.
        Self::bad_request(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Uptime and request counters backing `/healthz`.
pub struct ServerStats {
    started: Instant,
    requests: AtomicU64,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    stats: Arc<ServerStats>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            stats: Arc::new(ServerStats::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub task_id: String,
    pub template: Template,
    pub instruction: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub status: &'static str,
    pub task_id: String,
    pub run_id: Uuid,
    pub state: TaskState,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    pub task: Option<TaskRun>,
    pub events: Vec<TaskEvent>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskRun>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: f64,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Serialize)]
pub struct HealthMetrics {
    pub total_requests: u64,
    pub requests_per_minute: f64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/{id}", get(get_task))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/memory", get(get_memory))
        .route("/api/v1/events", get(events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_request,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(engine: Engine, bind: &str, port: u16) -> Result<()> {
    let app = build_router(AppState::new(engine));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("otter serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("otter serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Count the request, tag it with an id, and log both edges.
async fn track_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> axum::response::Response {
    let request_number = state.stats.requests.fetch_add(1, Ordering::Relaxed) + 1;
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    tracing::info!(%request_id, %method, %uri, request_number, "request started");

    let mut response = next.run(request).await;

    tracing::info!(
        %request_id,
        %method,
        %uri,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\
<html><head><title>otter</title></head><body>\
<h1>otter</h1>\
<p>Deterministic multi-agent coding task orchestrator.</p>\
<ul>\
<li><a href=\"/healthz\">/healthz</a></li>\
<li><a href=\"/api/v1/tasks\">/api/v1/tasks</a></li>\
<li><a href=\"/api/v1/metrics\">/api/v1/metrics</a></li>\
<li><a href=\"/api/v1/memory\">/api/v1/memory</a></li>\
<li><a href=\"/api/v1/events\">/api/v1/events</a> (SSE)</li>\
</ul>\
</body></html>",
    )
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.stats.started.elapsed();
    let total_requests = state.stats.requests.load(Ordering::Relaxed);
    let minutes = (uptime.as_secs_f64() / 60.0).max(1.0 / 60.0);
    Json(HealthResponse {
        status: "healthy",
        service: "otter",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime.as_secs_f64(),
        metrics: HealthMetrics {
            total_requests,
            requests_per_minute: total_requests as f64 / minutes,
        },
    })
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<CreateTaskResponse>, AppError> {
    let run = state.engine.submit(TaskRequest {
        task_id: body.task_id,
        template: body.template,
        instruction: body.instruction,
        model: body.model,
    })?;

    Ok(Json(CreateTaskResponse {
        status: "success",
        task_id: run.task_id,
        run_id: run.run_id,
        state: run.state,
    }))
}

async fn list_tasks(State(state): State<AppState>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: state.engine.list_tasks(),
    })
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetailResponse>, AppError> {
    let query = state
        .engine
        .query(&id)
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    Ok(Json(TaskDetailResponse {
        task: query.task,
        events: query.events,
        metrics: state.engine.metrics(),
    }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics())
}

async fn get_memory(State(state): State<AppState>) -> Json<MemoryStats> {
    Json(state.engine.memory_stats())
}

/// Server-sent event stream of task events, one JSON object per message.
///
/// Subscribers joining mid-run see only future events; a subscriber that
/// falls behind the broadcast buffer silently loses the oldest messages
/// rather than slowing the orchestrator down.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.engine.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        // Lagged receiver: skip the loss marker, keep streaming.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use otter_core::sandbox::SandboxConfig;
    use otter_core::EngineConfig;
    use tower::ServiceExt;

    fn test_state(sandbox_dir: &tempfile::TempDir) -> AppState {
        let config = EngineConfig {
            sandbox: SandboxConfig {
                root: sandbox_dir.path().to_path_buf(),
                templates_dir: None,
                command_timeout: Duration::from_secs(5),
            },
            ..EngineConfig::default()
        };
        AppState::new(Engine::new(config, None))
    }

    async fn send_get(state: AppState, uri: &str) -> axum::response::Response {
        let app = build_router(state);
        app.oneshot(
            HttpRequest::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn send_post(state: AppState, uri: &str, body: serde_json::Value) -> axum::response::Response {
        let app = build_router(state);
        app.oneshot(
            HttpRequest::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_returns_html() {
        let dir = tempfile::TempDir::new().unwrap();
        let resp = send_get(test_state(&dir), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/html"));
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let resp = send_get(test_state(&dir), "/healthz").await;
        assert!(resp.headers().get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn healthz_reports_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let resp = send_get(state, "/healthz").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["metrics"]["total_requests"], 1);
        assert!(json["uptime_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn create_task_returns_run_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let resp = send_post(
            test_state(&dir),
            "/api/v1/tasks",
            serde_json::json!({
                "task_id": "t1",
                "template": "react",
                "instruction": "Add division function",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["state"], "starting");
        assert!(json["run_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn task_query_returns_events_and_metrics() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let resp = send_post(
            state.clone(),
            "/api/v1/tasks",
            serde_json::json!({
                "task_id": "t-query",
                "template": "flask",
                "instruction": "Add /sum endpoint",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        state
            .engine
            .wait_for_terminal("t-query", Duration::from_secs(15))
            .await
            .expect("run should finish");

        let resp = send_get(state, "/api/v1/tasks/t-query").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let events = json["events"].as_array().unwrap();
        assert!(!events.is_empty());
        assert_eq!(events.last().unwrap()["stage"], "done");
        assert!(json["metrics"]["total_tasks"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let dir = tempfile::TempDir::new().unwrap();
        let resp = send_get(test_state(&dir), "/api/v1/tasks/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert!(json["detail"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn duplicate_submission_is_400() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);
        let body = serde_json::json!({
            "task_id": "dup",
            "template": "express",
            "instruction": "Add /healthz endpoint",
        });
        let first = send_post(state.clone(), "/api/v1/tasks", body.clone()).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = send_post(state, "/api/v1/tasks", body).await;
        // The first run may have already finished (stub pipeline is fast),
        // in which case resubmission is legal; otherwise it must be a 400.
        if second.status() != StatusCode::OK {
            assert_eq!(second.status(), StatusCode::BAD_REQUEST);
            let json = body_json(second).await;
            assert!(json["detail"].as_str().unwrap().contains("already active"));
        }
    }

    #[tokio::test]
    async fn metrics_and_memory_endpoints_respond() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);

        let resp = send_get(state.clone(), "/api/v1/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total_tasks"], 0);

        let resp = send_get(state, "/api/v1/memory").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["successful_plans"], 0);
        assert_eq!(json["max_memories"], 100);
    }

    #[tokio::test]
    async fn event_stream_negotiates_sse() {
        let dir = tempfile::TempDir::new().unwrap();
        let resp = send_get(test_state(&dir), "/api/v1/events").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn list_tasks_shows_active_runs_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = test_state(&dir);

        let resp = send_get(state.clone(), "/api/v1/tasks").await;
        let json = body_json(resp).await;
        assert_eq!(json["tasks"], serde_json::json!([]));
    }
}
