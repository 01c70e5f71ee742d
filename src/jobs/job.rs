use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    /// Covers the whole execution window; "running" is a logical sub-state
    /// observable only on the agent side.
    Assigned,
    Finished,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Renter-supplied job description. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub dataset_name: String,
    pub dataset_url: Option<String>,
    pub dataset_hash: Option<String>,
    /// Opaque renter metadata, carried through to the result untouched.
    pub meta: Map<String, Value>,
}

impl JobPayload {
    pub fn new(dataset_name: impl Into<String>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            dataset_url: None,
            dataset_hash: None,
            meta: Map::new(),
        }
    }
}

/// Optional per-job override of the executed program. When absent the
/// agent synthesizes a deterministic fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobScript {
    pub script: String,
    pub requirements: Option<String>,
    pub entrypoint: String,
}

impl JobScript {
    pub const DEFAULT_ENTRYPOINT: &'static str = "train.py";

    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            requirements: None,
            entrypoint: Self::DEFAULT_ENTRYPOINT.to_string(),
        }
    }
}

/// Result reported at finish. An empty `model_hash` with an error marker
/// in `meta` denotes a run that produced no artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub model_hash: String,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub assigned_node: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload, Utc::now())
    }

    pub fn with_id(job_id: String, payload: JobPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            payload,
            assigned_node: None,
            created_at,
            started_at: None,
            finished_at: None,
            result: None,
        }
    }
}
