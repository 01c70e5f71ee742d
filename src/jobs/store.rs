use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, YardError};
use crate::jobs::job::{Job, JobPayload, JobResult, JobScript};
use crate::store::Gateway;

/// Keyed digest an agent presents when acknowledging a job. The key is the
/// handshake secret delivered at registration.
pub fn sign_ack(handshake_key: &str, job_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(handshake_key.as_bytes());
    hasher.update(job_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Owns job records and the valid state transitions:
///
/// ```text
/// pending --ack--> assigned --finish--> finished
/// assigned|finished --restart--> pending
/// ```
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn Gateway>,
}

impl JobStore {
    pub fn new(store: Arc<dyn Gateway>) -> Self {
        Self { store }
    }

    /// Create a pending job. A fresh id is assigned when none is supplied.
    pub fn create(&self, job_id: Option<String>, payload: JobPayload) -> Result<String> {
        if payload.dataset_name.trim().is_empty() {
            return Err(YardError::InvalidPayload(
                "datasetName must not be empty".to_string(),
            ));
        }
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = Job::with_id(job_id.clone(), payload, Utc::now());
        if !self.store.insert_job(job) {
            return Err(YardError::InvalidPayload(format!(
                "job id already exists: {job_id}"
            )));
        }
        tracing::info!(job_id = %job_id, "Job created");
        Ok(job_id)
    }

    /// Read-only FCFS selection. Does not mutate state; concurrent pollers
    /// may observe the same job and race on [`JobStore::ack`].
    pub fn poll_oldest_pending(&self) -> Option<Job> {
        self.store.oldest_pending()
    }

    /// Claim a pending job for a node. This is the single conditional
    /// update in the system: of N concurrent callers exactly one succeeds,
    /// the rest observe [`YardError::JobUnavailable`] and must re-poll.
    ///
    /// When the node registered a handshake key, `signature` must be
    /// [`sign_ack`] over the job id; mismatches are rejected before the
    /// claim is attempted.
    pub fn ack(&self, job_id: &str, node_id: &str, signature: Option<&str>) -> Result<()> {
        if let Some(node) = self.store.get_node(node_id) {
            if let Some(key) = node.handshake_key.as_deref() {
                let expected = sign_ack(key, job_id);
                if signature != Some(expected.as_str()) {
                    return Err(YardError::BadSignature(job_id.to_string()));
                }
            }
        }

        if self.store.claim_if_pending(job_id, node_id, Utc::now()) {
            tracing::info!(job_id, node_id, "Job assigned");
            Ok(())
        } else {
            Err(YardError::JobUnavailable(job_id.to_string()))
        }
    }

    /// Record a completion report. The reporting node must be the current
    /// assignee; a re-finish by the assignee overwrites (last writer wins).
    /// Returns the updated job so the caller can cut the provenance record.
    pub fn finish(
        &self,
        job_id: &str,
        node_id: &str,
        model_hash: &str,
        metadata: Map<String, Value>,
    ) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .ok_or_else(|| YardError::JobNotFound(job_id.to_string()))?;

        if job.assigned_node.as_deref() != Some(node_id) {
            return Err(YardError::NotAssignee {
                job: job_id.to_string(),
                node: node_id.to_string(),
            });
        }

        let result = JobResult {
            model_hash: model_hash.to_string(),
            meta: metadata,
        };
        if !self.store.record_result(job_id, result, Utc::now()) {
            return Err(YardError::JobNotFound(job_id.to_string()));
        }
        tracing::info!(job_id, node_id, "Job finished");

        self.store
            .get_job(job_id)
            .ok_or_else(|| YardError::JobNotFound(job_id.to_string()))
    }

    /// Administrative reset to pending, clearing assignment and result so
    /// the job can be dispatched again.
    pub fn restart(&self, job_id: &str) -> Result<()> {
        if self.store.reset_job(job_id) {
            tracing::info!(job_id, "Job restarted");
            Ok(())
        } else {
            Err(YardError::JobNotFound(job_id.to_string()))
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.store.get_job(job_id)
    }

    pub fn list(&self) -> Vec<Job> {
        self.store.list_jobs()
    }

    pub fn upload_script(&self, job_id: &str, script: JobScript) -> Result<()> {
        if self.store.put_script(job_id, script) {
            Ok(())
        } else {
            Err(YardError::JobNotFound(job_id.to_string()))
        }
    }

    pub fn fetch_script(&self, job_id: &str) -> Option<JobScript> {
        self.store.get_script(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::registry::Node;
    use crate::store::MemoryStore;

    fn job_store() -> JobStore {
        JobStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn create_rejects_empty_dataset_name() {
        let jobs = job_store();
        let err = jobs.create(None, JobPayload::new("  ")).unwrap_err();
        assert!(matches!(err, YardError::InvalidPayload(_)));
    }

    #[test]
    fn ack_signature_is_checked_when_key_registered() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(store.clone());

        let mut node = Node::anonymous("n1".into(), Utc::now());
        node.handshake_key = Some("secret".into());
        store.upsert_node(node);

        let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();

        let err = jobs.ack(&job_id, "n1", Some("bogus")).unwrap_err();
        assert!(matches!(err, YardError::BadSignature(_)));
        // the failed signature must not have claimed the job
        assert_eq!(jobs.get(&job_id).unwrap().status, JobStatus::Pending);

        let sig = sign_ack("secret", &job_id);
        jobs.ack(&job_id, "n1", Some(&sig)).unwrap();
        assert_eq!(jobs.get(&job_id).unwrap().status, JobStatus::Assigned);
    }

    #[test]
    fn finish_requires_assignee() {
        let jobs = job_store();
        let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();
        jobs.ack(&job_id, "n1", None).unwrap();

        let err = jobs
            .finish(&job_id, "n2", "hash", Map::new())
            .unwrap_err();
        assert!(matches!(err, YardError::NotAssignee { .. }));

        let job = jobs.finish(&job_id, "n1", "hash", Map::new()).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result.unwrap().model_hash, "hash");
    }

    #[test]
    fn finish_unknown_job_is_not_found() {
        let jobs = job_store();
        let err = jobs
            .finish("missing", "n1", "hash", Map::new())
            .unwrap_err();
        assert!(matches!(err, YardError::JobNotFound(_)));
    }

    #[test]
    fn refinish_by_assignee_overwrites() {
        let jobs = job_store();
        let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();
        jobs.ack(&job_id, "n1", None).unwrap();

        jobs.finish(&job_id, "n1", "first", Map::new()).unwrap();
        let job = jobs.finish(&job_id, "n1", "second", Map::new()).unwrap();
        assert_eq!(job.result.unwrap().model_hash, "second");
    }

    #[test]
    fn sign_ack_is_deterministic_and_keyed() {
        let a = sign_ack("key", "job");
        assert_eq!(a, sign_ack("key", "job"));
        assert_ne!(a, sign_ack("other", "job"));
        assert_ne!(a, sign_ack("key", "job2"));
        assert_eq!(a.len(), 64);
    }
}
