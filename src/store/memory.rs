use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::ingest::{LogLine, ProvenanceRecord, UsageSample};
use crate::jobs::{Job, JobResult, JobScript, JobStatus};
use crate::registry::Node;
use crate::store::{Gateway, RemoveNode};

#[derive(Default)]
struct Tables {
    nodes: HashMap<String, Node>,
    jobs: HashMap<String, Job>,
    scripts: HashMap<String, JobScript>,
    logs: Vec<LogLine>,
    usage: Vec<UsageSample>,
    provenance: Vec<ProvenanceRecord>,
}

/// In-memory gateway. Each operation is one short critical section, which
/// is what makes [`Gateway::claim_if_pending`] an atomic conditional
/// update.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        // A poisoned lock means a writer panicked; the data itself is
        // plain records, so continue with whatever is there.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Gateway for MemoryStore {
    fn upsert_node(&self, mut node: Node) {
        let mut tables = self.write();
        if let Some(existing) = tables.nodes.get(&node.node_id) {
            node.last_seen = node.last_seen.max(existing.last_seen);
        }
        tables.nodes.insert(node.node_id.clone(), node);
    }

    fn touch_node(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        let mut tables = self.write();
        match tables.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_seen = node.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    fn get_node(&self, node_id: &str) -> Option<Node> {
        self.read().nodes.get(node_id).cloned()
    }

    fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn remove_idle_node(&self, node_id: &str) -> RemoveNode {
        let mut tables = self.write();
        if !tables.nodes.contains_key(node_id) {
            return RemoveNode::NotFound;
        }
        let busy = tables.jobs.values().any(|job| {
            job.status == JobStatus::Assigned && job.assigned_node.as_deref() == Some(node_id)
        });
        if busy {
            return RemoveNode::HasAssignedJob;
        }
        tables.nodes.remove(node_id);
        RemoveNode::Removed
    }

    fn insert_job(&self, job: Job) -> bool {
        let mut tables = self.write();
        if tables.jobs.contains_key(&job.job_id) {
            return false;
        }
        tables.jobs.insert(job.job_id.clone(), job);
        true
    }

    fn get_job(&self, job_id: &str) -> Option<Job> {
        self.read().jobs.get(job_id).cloned()
    }

    fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    fn oldest_pending(&self) -> Option<Job> {
        self.read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .cloned()
    }

    fn claim_if_pending(&self, job_id: &str, node_id: &str, now: DateTime<Utc>) -> bool {
        let mut tables = self.write();
        match tables.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Assigned;
                job.assigned_node = Some(node_id.to_string());
                job.started_at = Some(now);
                true
            }
            _ => false,
        }
    }

    fn record_result(&self, job_id: &str, result: JobResult, finished_at: DateTime<Utc>) -> bool {
        let mut tables = self.write();
        match tables.jobs.get_mut(job_id) {
            Some(job) => {
                job.status = JobStatus::Finished;
                job.finished_at = Some(finished_at);
                job.result = Some(result);
                true
            }
            None => false,
        }
    }

    fn reset_job(&self, job_id: &str) -> bool {
        let mut tables = self.write();
        match tables.jobs.get_mut(job_id) {
            Some(job) => {
                job.status = JobStatus::Pending;
                job.assigned_node = None;
                job.started_at = None;
                job.finished_at = None;
                job.result = None;
                true
            }
            None => false,
        }
    }

    fn put_script(&self, job_id: &str, script: JobScript) -> bool {
        let mut tables = self.write();
        if !tables.jobs.contains_key(job_id) {
            return false;
        }
        tables.scripts.insert(job_id.to_string(), script);
        true
    }

    fn get_script(&self, job_id: &str) -> Option<JobScript> {
        self.read().scripts.get(job_id).cloned()
    }

    fn append_log(&self, line: LogLine) {
        self.write().logs.push(line);
    }

    fn logs_for_job(&self, job_id: &str, limit: usize) -> Vec<LogLine> {
        let tables = self.read();
        let matching: Vec<&LogLine> = tables
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    fn append_usage(&self, sample: UsageSample) {
        self.write().usage.push(sample);
    }

    fn usage_for_job(&self, job_id: &str) -> Vec<UsageSample> {
        self.read()
            .usage
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect()
    }

    fn insert_provenance(&self, record: ProvenanceRecord) {
        self.write().provenance.push(record);
    }

    fn provenance_for_job(&self, job_id: &str) -> Vec<ProvenanceRecord> {
        self.read()
            .provenance
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }
}
