//! Append-only sinks for execution logs and resource usage, plus the
//! provenance recorder.
//!
//! Appends never gate job-state transitions; duplicates are legal since
//! streaming is at-most-effort rather than exactly-once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::jobs::Job;
use crate::store::Gateway;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub job_id: String,
    pub line: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    pub job_id: String,
    pub node_id: String,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub ts: DateTime<Utc>,
}

/// Immutable audit entry binding a job's result to the executing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub id: String,
    pub job_id: String,
    pub node_id: String,
    pub model_hash: String,
    pub model_size_bytes: u64,
    pub duration_seconds: u64,
    pub metadata: Map<String, Value>,
    pub ts: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IngestSink {
    store: Arc<dyn Gateway>,
}

impl IngestSink {
    pub fn new(store: Arc<dyn Gateway>) -> Self {
        Self { store }
    }

    pub fn append_log(&self, job_id: String, line: String) {
        self.store.append_log(LogLine {
            job_id,
            line,
            ts: Utc::now(),
        });
    }

    pub fn append_usage(&self, sample: UsageSample) {
        self.store.append_usage(sample);
    }

    /// Most recent log lines for a job, oldest first.
    pub fn recent_logs(&self, job_id: &str, limit: usize) -> Vec<LogLine> {
        self.store.logs_for_job(job_id, limit)
    }
}

#[derive(Clone)]
pub struct ProvenanceRecorder {
    store: Arc<dyn Gateway>,
}

impl ProvenanceRecorder {
    pub fn new(store: Arc<dyn Gateway>) -> Self {
        Self { store }
    }

    /// Create the immutable completion record for a finished job.
    pub fn record(
        &self,
        job: &Job,
        node_id: &str,
        model_hash: &str,
        model_size_bytes: u64,
        duration_seconds: u64,
        metadata: Map<String, Value>,
    ) -> ProvenanceRecord {
        let record = ProvenanceRecord {
            id: Uuid::new_v4().to_string(),
            job_id: job.job_id.clone(),
            node_id: node_id.to_string(),
            model_hash: model_hash.to_string(),
            model_size_bytes,
            duration_seconds,
            metadata,
            ts: Utc::now(),
        };
        self.store.insert_provenance(record.clone());
        record
    }

    pub fn for_job(&self, job_id: &str) -> Vec<ProvenanceRecord> {
        self.store.provenance_for_job(job_id)
    }
}
