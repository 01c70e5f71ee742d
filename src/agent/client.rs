use reqwest::StatusCode;

use crate::config::AgentConfig;
use crate::error::{Result, YardError};
use crate::jobs::JobScript;
use crate::server::{
    AckRequest, FinishRequest, FinishResponse, HeartbeatRequest, PolledJob, PollResponse,
    RegisterRequest, StreamLogRequest, UsageReportRequest,
};

/// Typed HTTP client for the coordinator API. All calls use the bounded
/// timeouts from [`AgentConfig`]; callers decide which failures are fatal.
#[derive(Clone)]
pub struct BackendClient {
    base: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            base: config.backend_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn register_node(&self, req: &RegisterRequest) -> Result<()> {
        self.http
            .post(self.url("/api/nodes/register"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        self.http
            .post(self.url("/api/nodes/heartbeat"))
            .json(&HeartbeatRequest {
                node_id: node_id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn poll_job(&self, node_id: &str) -> Result<Option<PolledJob>> {
        let resp = self
            .http
            .get(self.url("/api/jobs/poll"))
            .query(&[("nodeId", node_id)])
            .send()
            .await?
            .error_for_status()?
            .json::<PollResponse>()
            .await?;
        Ok(resp.job)
    }

    /// Claim a job. A rejected claim (someone else won the race, or the
    /// signature was refused) surfaces as [`YardError::JobUnavailable`].
    pub async fn ack_job(
        &self,
        node_id: &str,
        job_id: &str,
        signature: Option<String>,
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/api/jobs/ack"))
            .json(&AckRequest {
                node_id: node_id.to_string(),
                job_id: job_id.to_string(),
                signature,
            })
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT {
            Err(YardError::JobUnavailable(job_id.to_string()))
        } else {
            resp.error_for_status()?;
            Ok(())
        }
    }

    /// Fetch the renter's script override, if one was uploaded.
    pub async fn fetch_script(&self, job_id: &str) -> Result<Option<JobScript>> {
        let resp = self
            .http
            .get(self.url("/api/jobs/fetch-script"))
            .query(&[("jobId", job_id)])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json::<JobScript>().await?))
    }

    pub async fn stream_log(&self, job_id: &str, line: &str) -> Result<()> {
        self.http
            .post(self.url("/api/jobs/stream-log"))
            .json(&StreamLogRequest {
                job_id: job_id.to_string(),
                line: line.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn report_usage(&self, req: &UsageReportRequest) -> Result<()> {
        self.http
            .post(self.url("/api/usage-report"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn finish_job(&self, req: &FinishRequest) -> Result<FinishResponse> {
        let resp = self
            .http
            .post(self.url("/api/jobs/finish"))
            .json(req)
            .send()
            .await?
            .error_for_status()?
            .json::<FinishResponse>()
            .await?;
        Ok(resp)
    }
}
