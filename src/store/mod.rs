//! Persistence gateway.
//!
//! [`Gateway`] is the contract every backend component writes through. The
//! engine behind it is interchangeable; correctness under concurrent
//! callers rests on one primitive, [`Gateway::claim_if_pending`], the
//! single atomic conditional update in the system. Everything else is an
//! idempotent upsert, an unconditional write, or an ordered read.

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};

use crate::ingest::{LogLine, ProvenanceRecord, UsageSample};
use crate::jobs::{Job, JobResult, JobScript};
use crate::registry::Node;

/// Outcome of a conditional node removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveNode {
    Removed,
    HasAssignedJob,
    NotFound,
}

pub trait Gateway: Send + Sync {
    // --- nodes ---

    /// Insert or replace a node record. `last_seen` never moves backwards,
    /// whatever the caller passes.
    fn upsert_node(&self, node: Node);

    /// Advance `last_seen` to `max(current, now)`. Returns false if the
    /// node does not exist.
    fn touch_node(&self, node_id: &str, now: DateTime<Utc>) -> bool;

    fn get_node(&self, node_id: &str) -> Option<Node>;

    fn list_nodes(&self) -> Vec<Node>;

    /// Remove the node unless a job is currently assigned to it.
    fn remove_idle_node(&self, node_id: &str) -> RemoveNode;

    // --- jobs ---

    /// Insert a new job. Returns false if the id is already taken.
    fn insert_job(&self, job: Job) -> bool;

    fn get_job(&self, job_id: &str) -> Option<Job>;

    /// All jobs, newest first.
    fn list_jobs(&self) -> Vec<Job>;

    /// The pending job with the smallest `created_at`, ties broken by id
    /// order. Read-only; concurrent pollers may observe the same job.
    fn oldest_pending(&self) -> Option<Job>;

    /// The one compare-and-swap: assign the job to `node_id` and stamp
    /// `started_at`, but only if it is still pending. Returns whether the
    /// update took effect; under N concurrent callers exactly one sees true.
    fn claim_if_pending(&self, job_id: &str, node_id: &str, now: DateTime<Utc>) -> bool;

    /// Unconditionally mark the job finished with `result`. Last writer
    /// wins. Returns false if the job does not exist, in which case
    /// nothing is written.
    fn record_result(&self, job_id: &str, result: JobResult, finished_at: DateTime<Utc>) -> bool;

    /// Reset the job to pending, clearing assignment, timestamps, and
    /// result. Returns false if the job does not exist.
    fn reset_job(&self, job_id: &str) -> bool;

    // --- scripts ---

    /// Attach or replace the script override for a job. Returns false if
    /// the job does not exist.
    fn put_script(&self, job_id: &str, script: JobScript) -> bool;

    fn get_script(&self, job_id: &str) -> Option<JobScript>;

    // --- logs / usage ---

    fn append_log(&self, line: LogLine);

    /// The most recent `limit` lines for a job, in insertion order.
    fn logs_for_job(&self, job_id: &str, limit: usize) -> Vec<LogLine>;

    fn append_usage(&self, sample: UsageSample);

    fn usage_for_job(&self, job_id: &str) -> Vec<UsageSample>;

    // --- provenance ---

    fn insert_provenance(&self, record: ProvenanceRecord);

    fn provenance_for_job(&self, job_id: &str) -> Vec<ProvenanceRecord>;
}
