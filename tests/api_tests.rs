use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use trainyard::config::ServerConfig;
use trainyard::ingest::ProvenanceRecorder;
use trainyard::jobs::sign_ack;
use trainyard::server::{router, AppState};
use trainyard::store::MemoryStore;

fn test_app() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone(), &ServerConfig::default());
    (store, router(state))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn register_node(app: &Router, node_id: &str, handshake_key: Option<&str>) {
    let (status, _) = send(
        app,
        Method::POST,
        "/api/nodes/register",
        Some(json!({
            "nodeId": node_id,
            "specs": {"os": "linux", "cpuUsage": 12.5, "ramUsage": 40.0},
            "containerSupported": true,
            "handshakeKey": handshake_key,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn create_job(app: &Router, dataset: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/jobs/create",
        Some(json!({ "datasetName": dataset })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["jobId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn full_job_lifecycle_with_provenance() {
    let (store, app) = test_app();

    register_node(&app, "n1", Some("secret")).await;
    let job_id = create_job(&app, "mnist").await;

    // provider sees the pending job
    let (status, body) = send(&app, Method::GET, "/api/jobs/poll?nodeId=n1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["jobId"].as_str().unwrap(), job_id);
    assert_eq!(body["job"]["datasetName"].as_str().unwrap(), "mnist");

    // claim with a valid keyed signature
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "signature": sign_ack("secret", &job_id),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // renter material round-trips through the backend
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/upload-script",
        Some(json!({
            "jobId": job_id,
            "script": "print('training')",
            "requirements": "numpy",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, script) = send(
        &app,
        Method::GET,
        &format!("/api/jobs/fetch-script?jobId={job_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(script["script"].as_str().unwrap(), "print('training')");
    assert_eq!(script["entrypoint"].as_str().unwrap(), "train.py");

    // execution telemetry
    for line in ["epoch 1", "epoch 2"] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/jobs/stream-log",
            Some(json!({ "jobId": job_id, "line": line })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/usage-report",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "cpuPercent": 55.0,
            "ramPercent": 30.0,
            "ts": 1_700_000_000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // a bystander cannot finish someone else's job
    register_node(&app, "n2", None).await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n2",
            "jobId": job_id,
            "modelHash": "stolen",
            "modelSizeBytes": 1,
            "metadata": {},
            "durationSeconds": 1,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // the assignee finishes with a real result
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "modelHash": "abc123",
            "modelSizeBytes": 5,
            "metadata": {"datasetName": "mnist"},
            "durationSeconds": 42,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let provenance_id = body["provenanceId"].as_str().unwrap().to_string();

    // job view reflects the terminal state
    let (status, jobs) = send(&app, Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let job = jobs
        .as_array()
        .unwrap()
        .iter()
        .find(|j| j["jobId"] == job_id.as_str())
        .unwrap();
    assert_eq!(job["status"], "finished");
    assert_eq!(job["assignedNode"], "n1");
    assert_eq!(job["modelHash"], "abc123");

    // the immutable record binds job, node, and timing
    let records = ProvenanceRecorder::new(store).for_job(&job_id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, provenance_id);
    assert_eq!(records[0].node_id, "n1");
    assert_eq!(records[0].model_hash, "abc123");
    assert_eq!(records[0].duration_seconds, 42);

    // streamed lines are readable back in order
    let (status, logs) = send(
        &app,
        Method::GET,
        &format!("/api/jobs/logs?jobId={job_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let lines: Vec<&str> = logs
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["line"].as_str().unwrap())
        .collect();
    assert_eq!(lines, vec!["epoch 1", "epoch 2"]);
}

#[tokio::test]
async fn second_ack_loses_the_race() {
    let (_store, app) = test_app();
    register_node(&app, "n1", None).await;
    register_node(&app, "n2", None).await;
    let job_id = create_job(&app, "cifar").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n1", "jobId": job_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n2", "jobId": job_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not available"));

    // the loser's next poll finds nothing
    let (status, body) = send(&app, Method::GET, "/api/jobs/poll?nodeId=n2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn bad_ack_signature_does_not_claim() {
    let (_store, app) = test_app();
    register_node(&app, "n1", Some("secret")).await;
    let job_id = create_job(&app, "mnist").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n1", "jobId": job_id, "signature": "bogus" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, jobs) = send(&app, Method::GET, "/api/jobs", None).await;
    assert_eq!(jobs.as_array().unwrap()[0]["status"], "pending");
}

#[tokio::test]
async fn finish_unknown_job_is_404() {
    let (_store, app) = test_app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n1",
            "jobId": "ghost",
            "modelHash": "",
            "modelSizeBytes": 0,
            "metadata": {},
            "durationSeconds": 0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifactless_run_still_reaches_finished() {
    let (_store, app) = test_app();
    register_node(&app, "n1", None).await;
    let job_id = create_job(&app, "mnist").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n1", "jobId": job_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "modelHash": "",
            "modelSizeBytes": 0,
            "metadata": {"error": "no_model"},
            "durationSeconds": 3,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, jobs) = send(&app, Method::GET, "/api/jobs", None).await;
    let job = &jobs.as_array().unwrap()[0];
    assert_eq!(job["status"], "finished");
    assert_eq!(job["modelHash"], "");
}

#[tokio::test]
async fn poll_with_no_pending_jobs_returns_null() {
    let (_store, app) = test_app();
    let (status, body) = send(&app, Method::GET, "/api/jobs/poll?nodeId=n1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn fetch_script_for_unknown_job_is_404() {
    let (_store, app) = test_app();
    let (status, _) = send(&app, Method::GET, "/api/jobs/fetch-script?jobId=ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn node_views_carry_liveness_status() {
    let (_store, app) = test_app();
    register_node(&app, "n1", None).await;

    let (status, nodes) = send(&app, Method::GET, "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let node = &nodes.as_array().unwrap()[0];
    assert_eq!(node["nodeId"], "n1");
    assert_eq!(node["status"], "online");
    assert_eq!(node["specs"]["os"], "linux");
}

#[tokio::test]
async fn removing_a_busy_node_is_409() {
    let (_store, app) = test_app();
    register_node(&app, "n1", None).await;
    let job_id = create_job(&app, "mnist").await;

    send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n1", "jobId": job_id })),
    )
    .await;

    let (status, _) = send(&app, Method::DELETE, "/api/nodes/n1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "modelHash": "h",
            "modelSizeBytes": 1,
            "metadata": {},
            "durationSeconds": 1,
        })),
    )
    .await;

    let (status, _) = send(&app, Method::DELETE, "/api/nodes/n1", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn restart_requeues_a_finished_job() {
    let (_store, app) = test_app();
    register_node(&app, "n1", None).await;
    let job_id = create_job(&app, "mnist").await;

    send(
        &app,
        Method::POST,
        "/api/jobs/ack",
        Some(json!({ "nodeId": "n1", "jobId": job_id })),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/jobs/finish",
        Some(json!({
            "nodeId": "n1",
            "jobId": job_id,
            "modelHash": "h",
            "modelSizeBytes": 1,
            "metadata": {},
            "durationSeconds": 1,
        })),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/restart",
        Some(json!({ "jobId": job_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, "/api/jobs/poll?nodeId=n2", None).await;
    assert_eq!(body["job"]["jobId"].as_str().unwrap(), job_id);
}
