use aether::config::{DaemonConfig, DashboardConfig};
use aether::core::cluster::ClusterStateStore;
use aether::core::dashboard::{self, DashboardSnapshot, DashboardSource, SnapshotSink};
use aether::core::job::{Job, SubmitRequest};
use aether::core::queue::JobQueue;
use anyhow::Context;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub cluster: Arc<ClusterStateStore>,
    pub dashboard: DashboardSource,
    pub dashboard_config: DashboardConfig,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/submit", post(submit_job).fallback(method_not_allowed))
        .route("/jobs", get(list_jobs))
        .route("/state", get(cluster_state))
        .route("/health", get(get_health))
        .route("/ws", get(dashboard_ws))
        // Older dashboards connect on this path.
        .route("/graphql", get(dashboard_ws))
        .with_state(state)
}

pub async fn run(config: &DaemonConfig, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on: {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn bad_request(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Rejected submission: {}", rejection.body_text());
            return bad_request(rejection.body_text());
        }
    };

    let job = match Job::try_from(request) {
        Ok(job) => job,
        Err(e) => return bad_request(e.to_string()),
    };
    let (id, job_type) = (job.id.clone(), job.job_type);

    match state.queue.submit(job).await {
        Ok(pending) => {
            tracing::info!(
                "Added job to queue: ID={}, Type={} ({} pending)",
                id,
                job_type,
                pending
            );
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "status": "job added" })),
            )
        }
        Err(e) => bad_request(e.to_string()),
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({ "error": "Only POST method is allowed" })),
    )
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let pending = state.queue.pending().await;
    let dead_letters = state.queue.dead_letters().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "pending": pending, "dead_letters": dead_letters })),
    )
}

async fn cluster_state(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.cluster.snapshot().await))
}

async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let interval = Duration::from_secs(state.dashboard_config.interval_secs.max(1));
    let send_timeout = Duration::from_secs(state.dashboard_config.send_timeout_secs.max(1));
    ws.on_upgrade(move |socket| async move {
        tracing::info!("Dashboard observer connected");
        let end = dashboard::publish(
            WsSink(socket),
            state.dashboard,
            interval,
            send_timeout,
            state.shutdown,
        )
        .await;
        tracing::debug!("Dashboard session ended: {:?}", end);
    })
}

struct WsSink(WebSocket);

impl SnapshotSink for WsSink {
    async fn push(&mut self, snapshot: &DashboardSnapshot) -> anyhow::Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.0.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether::core::signals::FixedCarbonIntensity;
    use aether::core::telemetry::GpuState;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        let cluster = Arc::new(ClusterStateStore::new());
        AppState {
            queue: Arc::new(JobQueue::new()),
            dashboard: DashboardSource::new(
                Arc::clone(&cluster),
                Arc::new(FixedCarbonIntensity(100.0)),
                85,
            ),
            cluster,
            dashboard_config: DashboardConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    fn submit(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_valid_job() {
        let state = state();
        let response = router(state.clone())
            .oneshot(submit(r#"{"id":"job-1","type":"training"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["status"], "job added");
        assert_eq!(state.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_jobs() {
        let state = state();
        for body in [
            r#"{"id":"","type":"training"}"#,
            r#"{"id":"job-1","type":"batch"}"#,
            r#"{"id":"job-1""#,
        ] {
            let response = router(state.clone()).oneshot(submit(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            assert!(body_json(response).await["error"].is_string());
        }
        assert!(state.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_id() {
        let state = state();
        let body = r#"{"id":"job-1","type":"inference"}"#;
        let first = router(state.clone()).oneshot(submit(body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = router(state.clone()).oneshot(submit(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_wrong_method() {
        let request = Request::builder()
            .uri("/submit")
            .body(Body::empty())
            .unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_list_jobs_and_state() {
        let state = state();
        state
            .queue
            .submit(Job::new("job-9", aether::core::job::JobType::Inference))
            .await
            .unwrap();
        state
            .cluster
            .update(
                "gpu-0".to_string(),
                GpuState {
                    temp: 60,
                    mem_used: 1024,
                    utilization: 10,
                    power_draw_w: 90.0,
                    throttling_reasons: Vec::new(),
                },
            )
            .await;

        let jobs = router(state.clone())
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let jobs = body_json(jobs).await;
        assert_eq!(jobs["pending"][0]["id"], "job-9");
        assert_eq!(jobs["dead_letters"].as_array().unwrap().len(), 0);

        let cluster = router(state)
            .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cluster = body_json(cluster).await;
        assert_eq!(cluster["gpu-0"]["gpu_temp"], 60);
        assert_eq!(cluster["gpu-0"]["gpu_mem_used"], 1024);
        assert_eq!(cluster["gpu-0"]["utilization_gpu"], 10);
    }

    #[tokio::test]
    async fn test_dashboard_requires_upgrade() {
        let response = router(state())
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
