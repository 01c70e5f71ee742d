use std::sync::Arc;

use serde_json::Map;
use trainyard::jobs::{JobPayload, JobStatus, JobStore};
use trainyard::store::{Gateway, MemoryStore};
use trainyard::YardError;

fn job_store() -> (Arc<MemoryStore>, JobStore) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), JobStore::new(store))
}

#[tokio::test]
async fn concurrent_acks_have_exactly_one_winner() {
    let (_store, jobs) = job_store();
    let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let jobs = jobs.clone();
        let job_id = job_id.clone();
        handles.push(tokio::spawn(async move {
            jobs.ack(&job_id, &format!("node-{i}"), None).is_ok()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let job = jobs.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert!(job.assigned_node.is_some());
}

#[tokio::test]
async fn losing_agent_sees_no_pending_jobs() {
    let (_store, jobs) = job_store();
    let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();

    // both agents observed the same pending job
    let seen_a = jobs.poll_oldest_pending().unwrap();
    let seen_b = jobs.poll_oldest_pending().unwrap();
    assert_eq!(seen_a.job_id, seen_b.job_id);

    jobs.ack(&job_id, "agent-a", None).unwrap();
    let err = jobs.ack(&job_id, "agent-b", None).unwrap_err();
    assert!(matches!(err, YardError::JobUnavailable(_)));

    // the loser re-polls and finds nothing to do
    assert!(jobs.poll_oldest_pending().is_none());

    let job = jobs.get(&job_id).unwrap();
    assert_eq!(job.assigned_node.as_deref(), Some("agent-a"));
}

#[test]
fn poll_returns_oldest_pending_first() {
    let (_store, jobs) = job_store();
    let first = jobs.create(None, JobPayload::new("first")).unwrap();
    let second = jobs.create(None, JobPayload::new("second")).unwrap();

    assert_eq!(jobs.poll_oldest_pending().unwrap().job_id, first);

    // assigning the oldest exposes the next one
    jobs.ack(&first, "n1", None).unwrap();
    assert_eq!(jobs.poll_oldest_pending().unwrap().job_id, second);
}

#[test]
fn finish_unknown_job_performs_no_writes() {
    let (store, jobs) = job_store();
    jobs.create(Some("j1".to_string()), JobPayload::new("mnist"))
        .unwrap();

    let err = jobs
        .finish("ghost", "n1", "hash", Map::new())
        .unwrap_err();
    assert!(matches!(err, YardError::JobNotFound(_)));

    assert_eq!(store.list_jobs().len(), 1);
    assert_eq!(store.get_job("j1").unwrap().status, JobStatus::Pending);
    assert!(store.provenance_for_job("ghost").is_empty());
}

#[test]
fn timestamps_stay_monotonic_through_lifecycle() {
    let (_store, jobs) = job_store();
    let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();

    let created = jobs.get(&job_id).unwrap();
    assert!(created.started_at.is_none());
    assert!(created.finished_at.is_none());

    jobs.ack(&job_id, "n1", None).unwrap();
    let assigned = jobs.get(&job_id).unwrap();
    let started_at = assigned.started_at.unwrap();
    assert!(started_at >= assigned.created_at);

    let finished = jobs.finish(&job_id, "n1", "h", Map::new()).unwrap();
    assert!(finished.finished_at.unwrap() >= started_at);
    assert!(finished.result.is_some());
}

#[test]
fn restart_makes_job_dispatchable_again() {
    let (_store, jobs) = job_store();
    let job_id = jobs.create(None, JobPayload::new("mnist")).unwrap();

    jobs.ack(&job_id, "n1", None).unwrap();
    jobs.finish(&job_id, "n1", "h", Map::new()).unwrap();
    assert!(jobs.poll_oldest_pending().is_none());

    jobs.restart(&job_id).unwrap();
    let job = jobs.poll_oldest_pending().unwrap();
    assert_eq!(job.job_id, job_id);

    // a different node can now claim it
    jobs.ack(&job_id, "n2", None).unwrap();
    assert_eq!(
        jobs.get(&job_id).unwrap().assigned_node.as_deref(),
        Some("n2")
    );
}

#[test]
fn restart_unknown_job_is_not_found() {
    let (_store, jobs) = job_store();
    assert!(matches!(
        jobs.restart("ghost").unwrap_err(),
        YardError::JobNotFound(_)
    ));
}
