use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::agents::AgentProcessRegistry;
use crate::errors::{HubError, PreviewError};
use crate::hub::{EventKind, StreamEvent, StreamHub, sse};
use crate::preview::{PreviewStatus, PreviewSupervisor};
use crate::project::ProjectId;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub hub: Arc<StreamHub>,
    pub previews: PreviewSupervisor,
    pub agents: Arc<AgentProcessRegistry>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StartPreviewRequest {
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

pub const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Serialize)]
pub struct PreviewLogsResponse {
    pub logs: String,
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub terminated: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    /// A start that failed; the body carries the error status with its log excerpt.
    PreviewFailed { message: String, status: PreviewStatus },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({"error": msg})),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({"error": msg}))
            }
            ApiError::PreviewFailed { message, status } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": message, "status": status}),
            ),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({"error": msg}))
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

impl From<PreviewError> for ApiError {
    fn from(err: PreviewError) -> Self {
        match err {
            PreviewError::WorkspaceNotReady { .. } | PreviewError::InvalidTransition { .. } => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn parse_project_id(raw: &str) -> Result<ProjectId, ApiError> {
    ProjectId::new(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Map a failed start to a response carrying the project's error status.
fn start_failure(state: &AppState, project_id: &ProjectId, err: PreviewError) -> ApiError {
    match err {
        PreviewError::Allocation(_)
        | PreviewError::ReadinessTimeout { .. }
        | PreviewError::ExitedBeforeReady { .. }
        | PreviewError::SpawnFailed { .. } => ApiError::PreviewFailed {
            message: err.to_string(),
            status: state.previews.get_status(project_id),
        },
        other => other.into(),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/projects/{id}/stream", get(open_stream))
        .route("/api/projects/{id}/events", post(publish_event))
        .route("/api/projects/{id}/subscribers", get(subscriber_counts))
        .route("/api/projects/{id}/preview/start", post(start_preview))
        .route("/api/projects/{id}/preview/stop", post(stop_preview))
        .route("/api/projects/{id}/preview/restart", post(restart_preview))
        .route("/api/projects/{id}/preview/status", get(preview_status))
        .route("/api/projects/{id}/preview/logs", get(preview_logs))
        .route("/api/projects/{id}/install", post(install_dependencies))
        .route("/api/projects/{id}/agents/terminate", post(terminate_agents))
        .route("/api/agents", get(list_agents))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn open_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let project_id = parse_project_id(&id)?;
    Ok(sse::push_channel(&state.hub, project_id)?)
}

async fn publish_event(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    if matches!(req.kind, EventKind::Connected | EventKind::Heartbeat) {
        return Err(ApiError::BadRequest(format!(
            "'{}' events are generated by the hub",
            req.kind
        )));
    }
    let delivered = state
        .hub
        .publish(StreamEvent::new(req.kind, project_id, req.data));
    Ok(Json(PublishResponse { delivered }))
}

async fn subscriber_counts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    Ok(Json(state.hub.subscriber_counts(&project_id)))
}

async fn start_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    // The body is optional; an empty POST starts on any free port.
    let req: StartPreviewRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartPreviewRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid start request: {}", e)))?
    };

    match state.previews.start_on(&project_id, req.port).await {
        Ok(status) => Ok(Json(status)),
        Err(e) => Err(start_failure(&state, &project_id, e)),
    }
}

async fn stop_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    Ok(Json(state.previews.stop(&project_id).await?))
}

async fn restart_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    match state.previews.restart(&project_id).await {
        Ok(status) => Ok(Json(status)),
        Err(e) => Err(start_failure(&state, &project_id, e)),
    }
}

async fn preview_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    Ok(Json(state.previews.get_status(&project_id)))
}

async fn preview_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.previews.logs(&project_id, lines).join("\n");
    let running = state.previews.get_status(&project_id).is_running();
    Ok(Json(PreviewLogsResponse { logs, running }))
}

async fn install_dependencies(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    Ok(Json(state.previews.install_dependencies(&project_id).await?))
}

async fn list_agents(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.agents.running().await)
}

async fn terminate_agents(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = parse_project_id(&id)?;
    let terminated = state.agents.terminate_project(&project_id).await;
    Ok(Json(TerminateResponse { terminated }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::preview::{PreviewSettings, ProjectsRoot};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: SharedState,
        projects: TempDir,
    }

    fn test_app_with(config: HubConfig) -> TestApp {
        build_test_app(config, |_| {})
    }

    fn build_test_app(config: HubConfig, tweak: impl FnOnce(&mut PreviewSettings)) -> TestApp {
        let projects = tempfile::tempdir().unwrap();
        let hub = Arc::new(StreamHub::new(config));
        let mut settings = PreviewSettings {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            install_command: "/bin/sh".to_string(),
            install_args: vec!["-c".to_string(), "echo installed".to_string()],
            ..PreviewSettings::default()
        };
        tweak(&mut settings);
        let previews = PreviewSupervisor::new(
            settings,
            Arc::clone(&hub),
            Arc::new(ProjectsRoot::new(projects.path())),
        )
        .unwrap();
        let agents = Arc::new(AgentProcessRegistry::new(Arc::clone(&hub)));
        let state = Arc::new(AppState {
            hub,
            previews,
            agents,
        });
        TestApp {
            router: api_router().with_state(Arc::clone(&state)),
            state,
            projects,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(HubConfig::default())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_stream_rejects_invalid_project_id() {
        let app = test_app();
        let response = app
            .router
            .oneshot(get("/api/projects/bad%20id/stream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("bad id"));
    }

    #[tokio::test]
    async fn test_stream_unavailable_when_hub_full() {
        let app = test_app_with(HubConfig {
            max_subscribers: 0,
            ..HubConfig::default()
        });
        let response = app.router.oneshot(get("/api/projects/demo/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stream_opens_and_counts_subscriber() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(get("/api/projects/demo/stream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let counts = body_json(
            app.router
                .clone()
                .oneshot(get("/api/projects/demo/subscribers"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(counts["pushChannel"], 1);
        assert_eq!(counts["socket"], 0);

        drop(response);
        let counts = body_json(
            app.router
                .oneshot(get("/api/projects/demo/subscribers"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(counts["pushChannel"], 0);
    }

    #[tokio::test]
    async fn test_publish_event_reaches_subscribers() {
        let app = test_app();
        let demo = ProjectId::new("demo").unwrap();
        let mut sub = app
            .state
            .hub
            .subscribe(demo, crate::hub::TransportKind::Socket)
            .unwrap();
        sub.recv().await.unwrap();

        let response = app
            .router
            .oneshot(post_json(
                "/api/projects/demo/events",
                serde_json::json!({"type": "message", "data": {"text": "hi"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["delivered"], 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.payload["text"], "hi");
    }

    #[tokio::test]
    async fn test_publish_rejects_hub_generated_kinds() {
        let app = test_app();
        let response = app
            .router
            .oneshot(post_json(
                "/api/projects/demo/events",
                serde_json::json!({"type": "heartbeat"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_preview_status_defaults_to_stopped() {
        let app = test_app();
        let response = app
            .router
            .oneshot(get("/api/projects/demo/preview/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["projectId"], "demo");
        assert_eq!(status["state"], "stopped");
        assert!(status["port"].is_null());
    }

    #[tokio::test]
    async fn test_start_without_workspace_is_conflict() {
        let app = test_app();
        let response = app
            .router
            .oneshot(post_empty("/api/projects/ghost/preview/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_start_with_no_free_port_is_server_error() {
        // The only port in the range is taken.
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let app = build_test_app(HubConfig::default(), |settings| {
            settings.port_range = port..=port;
        });
        std::fs::create_dir_all(app.projects.path().join("demo").join("repo")).unwrap();

        let response = app
            .router
            .oneshot(post_empty("/api/projects/demo/preview/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("No free port"));
        assert_eq!(body["status"]["state"], "error");
        assert!(app.state.previews.leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_malformed_body() {
        let app = test_app();
        let response = app
            .router
            .oneshot(post_json(
                "/api/projects/demo/preview/start",
                serde_json::json!({"port": "high"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_of_never_started_preview_is_ok() {
        let app = test_app();
        let response = app
            .router
            .oneshot(post_empty("/api/projects/demo/preview/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "stopped");
    }

    #[tokio::test]
    async fn test_logs_empty_for_unknown_project() {
        let app = test_app();
        let response = app
            .router
            .oneshot(get("/api/projects/demo/preview/logs?lines=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["logs"], "");
        assert_eq!(body["running"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_runs_in_workspace() {
        let app = test_app();
        std::fs::create_dir_all(app.projects.path().join("demo").join("repo")).unwrap();
        let response = app
            .router
            .oneshot(post_empty("/api/projects/demo/install"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["output"].as_str().unwrap().contains("installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agents_listing_and_project_termination() {
        let app = test_app();
        let child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        app.state
            .agents
            .register("chat-1", ProjectId::new("demo").unwrap(), child)
            .await;

        let listed = body_json(app.router.clone().oneshot(get("/api/agents")).await.unwrap()).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["sessionId"], "chat-1");
        assert_eq!(listed[0]["projectId"], "demo");

        let response = app
            .router
            .clone()
            .oneshot(post_empty("/api/projects/demo/agents/terminate"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["terminated"], 1);

        let listed = body_json(app.router.oneshot(get("/api/agents")).await.unwrap()).await;
        assert!(listed.as_array().unwrap().is_empty());
    }
}
