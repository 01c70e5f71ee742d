use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Liveness thresholds used to derive a node's status from its last
/// heartbeat. A node is online below the online window, warning below the
/// warning window, offline beyond it.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub online_window: Duration,
    pub warning_window: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            online_window: Duration::from_secs(30),
            warning_window: Duration::from_secs(300),
        }
    }
}

/// Configuration for the coordinator server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub liveness: LivenessConfig,
    /// Optional external provenance mirror. When set, completion records
    /// are POSTed here best-effort after each finish.
    pub mirror_url: Option<String>,
    /// Bearer token presented to the provenance mirror.
    pub mirror_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:8000"
                .parse()
                .expect("default listen address is valid"),
            liveness: LivenessConfig::default(),
            mirror_url: None,
            mirror_token: None,
        }
    }
}

/// Configuration for the provider agent.
///
/// One job is processed at a time; the poll loop blocks while a job runs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the coordinator backend.
    pub backend_url: String,
    /// Interval between job polls.
    pub poll_interval: Duration,
    /// Interval between heartbeats. Heartbeats run for the lifetime of the
    /// process, independent of job state.
    pub heartbeat_interval: Duration,
    /// Cadence of the per-run resource usage sampler.
    pub usage_sample_interval: Duration,
    /// Root directory for per-job build contexts and output mounts.
    pub workdir: PathBuf,
    /// Prefix for execution image tags; the full tag is derived from the
    /// job id so rebuilds of the same job are reproducible.
    pub image_prefix: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".to_string(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            usage_sample_interval: Duration::from_secs(4),
            workdir: PathBuf::from("./workspace/jobs"),
            image_prefix: "trainyard-trainer".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}
