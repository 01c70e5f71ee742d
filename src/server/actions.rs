//! Post-completion side effects.
//!
//! Fired after a job is durably marked finished, off the request path.
//! Each action is attempted independently and best-effort: a failure is
//! logged and never rolls back the job's finished status or blocks the
//! other actions. Outcomes are never awaited by the core flow.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::ingest::ProvenanceRecord;

const PRICE_PER_MINUTE_USD: f64 = 0.05;

#[derive(Clone)]
pub struct CompletionActions {
    mirror_url: Option<String>,
    mirror_token: Option<String>,
    http: reqwest::Client,
}

impl CompletionActions {
    pub fn new(mirror_url: Option<String>, mirror_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            mirror_url,
            mirror_token,
            http,
        }
    }

    /// Spawn the pipeline for a freshly finished job and return immediately.
    pub fn dispatch(&self, record: ProvenanceRecord) {
        let actions = self.clone();
        tokio::spawn(async move {
            actions.run(record).await;
        });
    }

    async fn run(&self, record: ProvenanceRecord) {
        if let Err(e) = self.mirror_write(&record).await {
            tracing::warn!(job_id = %record.job_id, error = %e, "Provenance mirror write failed");
        }

        let cost = Self::cost_for(record.duration_seconds);
        let tx = Self::execute_payment(&record);
        tracing::info!(
            job_id = %record.job_id,
            node_id = %record.node_id,
            cost_usd = cost,
            tx_hash = %tx,
            "Payment recorded"
        );

        Self::trigger_reward(&record.node_id, &record.job_id);
    }

    /// Mirror the completion record to the external provenance store, when
    /// one is configured.
    async fn mirror_write(&self, record: &ProvenanceRecord) -> crate::error::Result<()> {
        let Some(url) = self.mirror_url.as_deref() else {
            return Ok(());
        };

        let mut request = self
            .http
            .post(url)
            .json(&serde_json::json!({ "record": record }));
        if let Some(token) = self.mirror_token.as_deref() {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()?;
        tracing::debug!(job_id = %record.job_id, "Provenance mirrored");
        Ok(())
    }

    /// Flat per-minute pricing, billed in whole minutes with a one-minute
    /// floor.
    pub fn cost_for(duration_seconds: u64) -> f64 {
        (duration_seconds / 60).max(1) as f64 * PRICE_PER_MINUTE_USD
    }

    /// Payment stub. Real settlement lives outside this repository; a
    /// deterministic pseudo transaction hash lets the read side display
    /// something stable in the meantime.
    pub fn execute_payment(record: &ProvenanceRecord) -> String {
        let cost = Self::cost_for(record.duration_seconds);
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}:{}:{}",
                record.node_id,
                cost,
                record.ts.timestamp()
            )
            .as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    /// Reward-registry trigger stub.
    fn trigger_reward(node_id: &str, job_id: &str) {
        tracing::info!(node_id, job_id, "Reward trigger queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(duration_seconds: u64) -> ProvenanceRecord {
        ProvenanceRecord {
            id: "p1".into(),
            job_id: "j1".into(),
            node_id: "n1".into(),
            model_hash: "h".into(),
            model_size_bytes: 1,
            duration_seconds,
            metadata: Default::default(),
            ts: Utc::now(),
        }
    }

    #[test]
    fn cost_has_one_minute_floor() {
        assert_eq!(CompletionActions::cost_for(0), PRICE_PER_MINUTE_USD);
        assert_eq!(CompletionActions::cost_for(59), PRICE_PER_MINUTE_USD);
        assert_eq!(CompletionActions::cost_for(60), PRICE_PER_MINUTE_USD);
        assert_eq!(CompletionActions::cost_for(600), 10.0 * PRICE_PER_MINUTE_USD);
    }

    #[test]
    fn payment_stub_is_deterministic() {
        let r = record(120);
        assert_eq!(
            CompletionActions::execute_payment(&r),
            CompletionActions::execute_payment(&r)
        );
    }
}
