//! REST surface of the coordinator.
//!
//! Request-per-call handlers over the shared persistence gateway; no job
//! state is cached in-process, so correctness under concurrent callers
//! rests on the gateway's conditional update at ack.

pub mod actions;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::error::YardError;
use crate::ingest::{IngestSink, ProvenanceRecorder, UsageSample};
use crate::jobs::{JobScript, JobStore};
use crate::registry::{NodeRegistry, NodeSpecs};
use crate::store::Gateway;

use actions::CompletionActions;

#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub jobs: JobStore,
    pub sink: IngestSink,
    pub provenance: ProvenanceRecorder,
    pub actions: CompletionActions,
}

impl AppState {
    pub fn new(store: Arc<dyn Gateway>, config: &ServerConfig) -> Self {
        Self {
            registry: NodeRegistry::new(store.clone(), config.liveness.clone()),
            jobs: JobStore::new(store.clone()),
            sink: IngestSink::new(store.clone()),
            provenance: ProvenanceRecorder::new(store),
            actions: CompletionActions::new(
                config.mirror_url.clone(),
                config.mirror_token.clone(),
            ),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node_id: String,
    pub specs: NodeSpecs,
    #[serde(default)]
    pub container_supported: bool,
    #[serde(default)]
    pub handshake_key: Option<String>,
    #[serde(default)]
    pub payout_addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub status: String,
    pub node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub dataset_name: String,
    #[serde(default)]
    pub dataset_url: Option<String>,
    #[serde(default)]
    pub dataset_hash: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdResponse {
    pub status: String,
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    #[allow(dead_code)]
    pub node_id: String,
}

/// What a provider sees when polling: the payload, no assignment state.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolledJob {
    pub job_id: String,
    pub dataset_name: String,
    pub dataset_url: Option<String>,
    pub meta: Map<String, Value>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub job: Option<PolledJob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub node_id: String,
    pub job_id: String,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptQuery {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadScriptRequest {
    pub job_id: String,
    pub script: String,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLogRequest {
    pub job_id: String,
    pub line: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReportRequest {
    pub node_id: String,
    pub job_id: String,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub ts: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    pub node_id: String,
    pub job_id: String,
    pub model_hash: String,
    pub model_size_bytes: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub duration_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishResponse {
    pub status: String,
    pub job_id: String,
    pub provenance_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub status: String,
    pub dataset_name: String,
    pub assigned_node: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub model_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: String,
    pub status: String,
    pub last_seen: i64,
    pub container_supported: bool,
    pub specs: NodeSpecs,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    pub job_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogView {
    pub line: String,
    pub ts: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub job_id: String,
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/nodes/register", post(register_node))
        .route("/api/nodes/heartbeat", post(heartbeat))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:node_id", delete(remove_node))
        .route("/api/jobs/create", post(create_job))
        .route("/api/jobs/poll", get(poll_job))
        .route("/api/jobs/ack", post(ack_job))
        .route("/api/jobs/fetch-script", get(fetch_script))
        .route("/api/jobs/upload-script", post(upload_script))
        .route("/api/jobs/stream-log", post(stream_log))
        .route("/api/jobs/finish", post(finish_job))
        .route("/api/jobs/restart", post(restart_job))
        .route("/api/jobs/logs", get(job_logs))
        .route("/api/jobs", get(list_jobs))
        .route("/api/usage-report", post(usage_report))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting coordinator server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn error_response(err: YardError) -> Response {
    let status = match err {
        YardError::JobNotFound(_) | YardError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        YardError::JobUnavailable(_)
        | YardError::BadSignature(_)
        | YardError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        YardError::NodeBusy(_) | YardError::NotAssignee { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let mut specs = req.specs;
    if req.payout_addr.is_some() {
        specs.payout_addr = req.payout_addr;
    }
    state.registry.register(
        req.node_id.clone(),
        specs,
        req.container_supported,
        req.handshake_key,
    );
    Json(NodeResponse {
        status: "ok".to_string(),
        node_id: req.node_id,
    })
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    state.registry.heartbeat(&req.node_id);
    Json(NodeResponse {
        status: "ok".to_string(),
        node_id: req.node_id,
    })
}

async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let nodes: Vec<NodeView> = state
        .registry
        .list()
        .into_iter()
        .map(|node| NodeView {
            status: state.registry.status(&node, now).to_string(),
            last_seen: node.last_seen.timestamp(),
            node_id: node.node_id,
            container_supported: node.container_supported,
            specs: node.specs,
        })
        .collect();
    Json(nodes)
}

async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Response {
    match state.registry.remove(&node_id) {
        Ok(()) => Json(NodeResponse {
            status: "ok".to_string(),
            node_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

// =============================================================================
// Job Handlers
// =============================================================================

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Response {
    let payload = crate::jobs::JobPayload {
        dataset_name: req.dataset_name,
        dataset_url: req.dataset_url,
        dataset_hash: req.dataset_hash,
        meta: req.meta,
    };
    match state.jobs.create(req.job_id, payload) {
        Ok(job_id) => Json(JobIdResponse {
            status: "ok".to_string(),
            job_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn poll_job(
    State(state): State<AppState>,
    Query(_query): Query<PollQuery>,
) -> impl IntoResponse {
    let job = state.jobs.poll_oldest_pending().map(|job| PolledJob {
        job_id: job.job_id,
        dataset_name: job.payload.dataset_name,
        dataset_url: job.payload.dataset_url,
        meta: job.payload.meta,
        created_at: job.created_at.timestamp(),
    });
    Json(PollResponse { job })
}

async fn ack_job(State(state): State<AppState>, Json(req): Json<AckRequest>) -> Response {
    match state
        .jobs
        .ack(&req.job_id, &req.node_id, req.signature.as_deref())
    {
        Ok(()) => Json(JobIdResponse {
            status: "ok".to_string(),
            job_id: req.job_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn fetch_script(
    State(state): State<AppState>,
    Query(query): Query<ScriptQuery>,
) -> Response {
    match state.jobs.fetch_script(&query.job_id) {
        Some(script) => Json(script).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no script uploaded for job: {}", query.job_id),
            }),
        )
            .into_response(),
    }
}

async fn upload_script(
    State(state): State<AppState>,
    Json(req): Json<UploadScriptRequest>,
) -> Response {
    let script = JobScript {
        script: req.script,
        requirements: req.requirements,
        entrypoint: req
            .entrypoint
            .unwrap_or_else(|| JobScript::DEFAULT_ENTRYPOINT.to_string()),
    };
    match state.jobs.upload_script(&req.job_id, script) {
        Ok(()) => Json(JobIdResponse {
            status: "ok".to_string(),
            job_id: req.job_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn stream_log(
    State(state): State<AppState>,
    Json(req): Json<StreamLogRequest>,
) -> impl IntoResponse {
    state.sink.append_log(req.job_id, req.line);
    Json(OkResponse {
        status: "ok".to_string(),
    })
}

async fn usage_report(
    State(state): State<AppState>,
    Json(req): Json<UsageReportRequest>,
) -> impl IntoResponse {
    let ts = chrono::DateTime::from_timestamp(req.ts, 0).unwrap_or_else(Utc::now);
    state.sink.append_usage(UsageSample {
        job_id: req.job_id,
        node_id: req.node_id,
        cpu_percent: req.cpu_percent,
        ram_percent: req.ram_percent,
        ts,
    });
    Json(OkResponse {
        status: "ok".to_string(),
    })
}

async fn finish_job(State(state): State<AppState>, Json(req): Json<FinishRequest>) -> Response {
    let job = match state
        .jobs
        .finish(&req.job_id, &req.node_id, &req.model_hash, req.metadata.clone())
    {
        Ok(job) => job,
        Err(err) => return error_response(err),
    };

    let record = state.provenance.record(
        &job,
        &req.node_id,
        &req.model_hash,
        req.model_size_bytes,
        req.duration_seconds,
        req.metadata,
    );
    let provenance_id = record.id.clone();
    state.actions.dispatch(record);

    Json(FinishResponse {
        status: "ok".to_string(),
        job_id: req.job_id,
        provenance_id,
    })
    .into_response()
}

async fn restart_job(
    State(state): State<AppState>,
    Json(req): Json<RestartRequest>,
) -> Response {
    match state.jobs.restart(&req.job_id) {
        Ok(()) => Json(JobIdResponse {
            status: "ok".to_string(),
            job_id: req.job_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let jobs: Vec<JobView> = state
        .jobs
        .list()
        .into_iter()
        .map(|job| JobView {
            job_id: job.job_id,
            status: job.status.to_string(),
            dataset_name: job.payload.dataset_name,
            assigned_node: job.assigned_node,
            created_at: job.created_at.timestamp(),
            started_at: job.started_at.map(|t| t.timestamp()),
            finished_at: job.finished_at.map(|t| t.timestamp()),
            model_hash: job.result.map(|r| r.model_hash),
        })
        .collect();
    Json(jobs)
}

async fn job_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(200);
    let lines: Vec<LogView> = state
        .sink
        .recent_logs(&query.job_id, limit)
        .into_iter()
        .map(|l| LogView {
            line: l.line,
            ts: l.ts.timestamp(),
        })
        .collect();
    Json(lines)
}
