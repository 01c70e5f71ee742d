use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use trainyard::agent::ProviderAgent;
use trainyard::config::{AgentConfig, LivenessConfig, ServerConfig};
use trainyard::server::{AppState, JobView, NodeView};
use trainyard::shutdown::install_shutdown_handler;
use trainyard::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "trainyard")]
#[command(version)]
#[command(about = "Coordinator and provider agent for container-isolated training jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator server
    Server(ServerArgs),

    /// Start a provider agent
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node management commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Seconds of silence before a node drops from online to warning
    #[arg(long, default_value = "30")]
    online_window_secs: u64,

    /// Seconds of silence before a node drops from warning to offline
    #[arg(long, default_value = "300")]
    warning_window_secs: u64,

    /// External provenance mirror URL (completion records are POSTed here
    /// best-effort)
    #[arg(long)]
    mirror_url: Option<String>,

    /// Bearer token for the provenance mirror
    #[arg(long, requires = "mirror_url")]
    mirror_token: Option<String>,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Coordinator base URL
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    backend: String,

    /// Root directory for per-job build contexts
    #[arg(long, default_value = "./workspace/jobs")]
    workdir: PathBuf,

    /// Seconds between job polls
    #[arg(long, default_value = "5")]
    poll_interval_secs: u64,

    /// Seconds between heartbeats
    #[arg(long, default_value = "10")]
    heartbeat_interval_secs: u64,

    /// Prefix for execution image tags
    #[arg(long, default_value = "trainyard-trainer")]
    image_prefix: String,
}

// =============================================================================
// Client Arguments (shared by job and node commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new training job
    Submit {
        /// Dataset name
        dataset: String,

        /// Dataset download URL
        #[arg(long)]
        url: Option<String>,

        /// Expected dataset content hash
        #[arg(long)]
        hash: Option<String>,
    },
    /// Show one job
    Status {
        /// The job id
        job_id: String,
    },
    /// List all jobs, newest first
    List,
    /// Reset a job to pending so it is dispatched again
    Restart {
        /// The job id
        job_id: String,
    },
    /// Show recent execution log lines for a job
    Logs {
        /// The job id
        job_id: String,

        /// Number of lines to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List registered nodes with liveness status
    List,
    /// Remove a node (rejected while it holds an assigned job)
    Remove {
        /// The node id
        node_id: String,
    },
}

// =============================================================================
// Server / Agent Entry Points
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = ServerConfig {
        listen_addr,
        liveness: LivenessConfig {
            online_window: Duration::from_secs(args.online_window_secs),
            warning_window: Duration::from_secs(args.warning_window_secs),
        },
        mirror_url: args.mirror_url,
        mirror_token: args.mirror_token,
    };

    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store, &config);
    let shutdown = install_shutdown_handler();

    trainyard::server::run_server(config.listen_addr, state, shutdown).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig {
        backend_url: args.backend,
        workdir: args.workdir,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        image_prefix: args.image_prefix,
        ..AgentConfig::default()
    };

    let agent = ProviderAgent::new(config)?;
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn api(client: &ClientArgs, path: &str) -> String {
    format!("{}{}", client.addr.trim_end_matches('/'), path)
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    dataset: String,
    url: Option<String>,
    hash: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = serde_json::json!({
        "datasetName": dataset,
        "datasetUrl": url,
        "datasetHash": hash,
    });
    let resp: serde_json::Value = http
        .post(api(client, "/api/jobs/create"))
        .json(&body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            if let Some(job_id) = resp.get("jobId").and_then(|v| v.as_str()) {
                println!("Job ID: {}", job_id);
            }
        }
    }
    Ok(())
}

async fn fetch_jobs(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<Vec<JobView>, Box<dyn std::error::Error>> {
    Ok(http
        .get(api(client, "/api/jobs"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

fn print_job(job: &JobView) {
    println!("Job ID:        {}", job.job_id);
    println!("Status:        {}", job.status);
    println!("Dataset:       {}", job.dataset_name);
    if let Some(node) = &job.assigned_node {
        println!("Assigned Node: {}", node);
    }
    if let Some(hash) = &job.model_hash {
        let display = if hash.is_empty() { "(empty)" } else { hash };
        println!("Model Hash:    {}", display);
    }
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = fetch_jobs(http, client).await?;
    let Some(job) = jobs.into_iter().find(|j| j.job_id == job_id) else {
        eprintln!("Error: job not found: {}", job_id);
        std::process::exit(1);
    };

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = fetch_jobs(http, client).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:<20} NODE", "JOB ID", "STATUS", "DATASET");
            println!("{}", "-".repeat(84));
            for job in &jobs {
                let node = job.assigned_node.as_deref().unwrap_or("-");
                let dataset = if job.dataset_name.len() > 18 {
                    format!("{}...", &job.dataset_name[..15])
                } else {
                    job.dataset_name.clone()
                };
                println!(
                    "{:<38} {:<10} {:<20} {}",
                    job.job_id, job.status, dataset, node
                );
            }
        }
    }
    Ok(())
}

async fn handle_job_restart(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = http
        .post(api(client, "/api/jobs/restart"))
        .json(&serde_json::json!({ "jobId": job_id }))
        .send()
        .await?;
    if resp.status().is_success() {
        println!("Job {} reset to pending", job_id);
    } else {
        eprintln!("Error: restart failed: {}", resp.status());
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_job_logs(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let lines: Vec<serde_json::Value> = http
        .get(api(client, "/api/jobs/logs"))
        .query(&[("jobId", job_id.as_str()), ("limit", &limit.to_string())])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
        OutputFormat::Table => {
            for entry in &lines {
                if let Some(line) = entry.get("line").and_then(|v| v.as_str()) {
                    println!("{}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_node_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Vec<NodeView> = http
        .get(api(client, "/api/nodes"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
        OutputFormat::Table => {
            if nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }
            println!("{:<38} {:<9} {:<10} OS", "NODE ID", "STATUS", "CONTAINERS");
            println!("{}", "-".repeat(70));
            for node in &nodes {
                let containers = if node.container_supported { "yes" } else { "no" };
                println!(
                    "{:<38} {:<9} {:<10} {}",
                    node.node_id, node.status, containers, node.specs.os
                );
            }
        }
    }
    Ok(())
}

async fn handle_node_remove(
    http: &reqwest::Client,
    client: &ClientArgs,
    node_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = http
        .delete(api(client, &format!("/api/nodes/{}", node_id)))
        .send()
        .await?;
    let status = resp.status();
    if status.is_success() {
        println!("Node {} removed", node_id);
    } else if status == reqwest::StatusCode::CONFLICT {
        eprintln!("Error: node {} still holds an assigned job", node_id);
        std::process::exit(1);
    } else {
        eprintln!("Error: remove failed: {}", status);
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit { dataset, url, hash } => {
                    handle_job_submit(&http, &client, dataset, url, hash).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::List => handle_job_list(&http, &client).await?,
                JobCommands::Restart { job_id } => {
                    handle_job_restart(&http, &client, job_id).await?;
                }
                JobCommands::Logs { job_id, limit } => {
                    handle_job_logs(&http, &client, job_id, limit).await?;
                }
            }
        }
        Commands::Node { client, command } => {
            let http = reqwest::Client::new();
            match command {
                NodeCommands::List => handle_node_list(&http, &client).await?,
                NodeCommands::Remove { node_id } => {
                    handle_node_remove(&http, &client, node_id).await?;
                }
            }
        }
    }

    Ok(())
}
