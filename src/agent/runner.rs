//! Per-job execution pipeline.
//!
//! After an acknowledged claim the runner resolves the job's material,
//! materializes an isolated build context, builds and runs the execution
//! image, streams logs and usage while the container runs, then hashes the
//! produced artifact and reports completion. Every acknowledged job ends
//! in a finish report, artifact or not; a job is never left assigned
//! because nothing was produced.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::agent::client::BackendClient;
use crate::agent::sysprobe;
use crate::config::AgentConfig;
use crate::error::{Result, YardError};
use crate::jobs::JobScript;
use crate::server::{FinishRequest, PolledJob, UsageReportRequest};

/// Names that identify the produced model regardless of size.
const CANONICAL_ARTIFACTS: [&str; 4] = ["model.bin", "pytorch_model.bin", "model.pt", "model.pth"];

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

pub struct JobRunner {
    config: AgentConfig,
    client: BackendClient,
    node_id: String,
}

impl JobRunner {
    pub fn new(config: AgentConfig, client: BackendClient, node_id: String) -> Self {
        Self {
            config,
            client,
            node_id,
        }
    }

    /// Run the full pipeline for an acknowledged job. Always reports
    /// finish; pipeline failures degrade to an empty, error-annotated
    /// result rather than an abandoned assignment.
    pub async fn process(&self, job: &PolledJob) -> Result<()> {
        let started = Instant::now();
        let job_dir = self.config.workdir.join(&job.job_id);

        let outcome = self.execute(job, &job_dir).await;
        let duration_seconds = started.elapsed().as_secs();

        let mut metadata = Map::new();
        metadata.insert(
            "datasetName".to_string(),
            Value::String(job.dataset_name.clone()),
        );
        if let Some(url) = &job.dataset_url {
            metadata.insert("datasetUrl".to_string(), Value::String(url.clone()));
        }

        let (model_hash, model_size_bytes) = match outcome {
            Ok(Some((hash, size))) => {
                tracing::info!(
                    job_id = %job.job_id,
                    model_hash = %hash,
                    model_size_bytes = size,
                    "Artifact hashed"
                );
                (hash, size)
            }
            Ok(None) => {
                tracing::warn!(job_id = %job.job_id, "Run produced no artifact");
                metadata.insert("error".to_string(), Value::String("no_model".to_string()));
                (String::new(), 0)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Job pipeline failed");
                metadata.insert(
                    "error".to_string(),
                    Value::String(match e {
                        YardError::Docker(_) => "build_failed".to_string(),
                        other => other.to_string(),
                    }),
                );
                (String::new(), 0)
            }
        };

        self.client
            .finish_job(&FinishRequest {
                node_id: self.node_id.clone(),
                job_id: job.job_id.clone(),
                model_hash,
                model_size_bytes,
                metadata,
                duration_seconds,
            })
            .await?;
        tracing::info!(job_id = %job.job_id, duration_seconds, "Finish reported");
        Ok(())
    }

    async fn execute(&self, job: &PolledJob, job_dir: &Path) -> Result<Option<(String, u64)>> {
        tokio::fs::create_dir_all(job_dir).await?;

        let entrypoint = self.resolve_material(job, job_dir).await?;
        write_dockerfile(job_dir, &entrypoint)?;

        let tag = self.build_image(&job.job_id, job_dir).await?;

        let output_dir = job_dir.join("output");
        tokio::fs::create_dir_all(&output_dir).await?;
        self.run_container(&tag, &output_dir, &job.job_id).await?;

        match select_artifact(&output_dir)? {
            Some(path) => {
                let hashed = tokio::task::spawn_blocking(move || hash_artifact(&path))
                    .await
                    .map_err(|e| YardError::Internal(e.to_string()))??;
                Ok(Some(hashed))
            }
            None => Ok(None),
        }
    }

    /// Decide what program the container runs and write it into the build
    /// context. Priority: backend script override, then a script already
    /// present in the job dir, then a synthesized fallback that writes a
    /// placeholder artifact so the finish contract holds for script-less
    /// jobs.
    async fn resolve_material(&self, job: &PolledJob, job_dir: &Path) -> Result<String> {
        match self.client.fetch_script(&job.job_id).await {
            Ok(Some(script)) => {
                tracing::info!(job_id = %job.job_id, "Using renter script from backend");
                write_job_files(job_dir, &script)?;
                let entry = job_dir.join(&script.entrypoint);
                if !entry.exists() {
                    tracing::warn!(
                        job_id = %job.job_id,
                        entrypoint = %script.entrypoint,
                        "Entrypoint missing from saved files"
                    );
                }
                Ok(script.entrypoint)
            }
            Ok(None) | Err(_) => {
                let local = job_dir.join(JobScript::DEFAULT_ENTRYPOINT);
                if local.exists() {
                    tracing::info!(job_id = %job.job_id, "Using existing local script");
                } else {
                    tracing::info!(job_id = %job.job_id, "No script available, synthesizing fallback");
                    let fallback = JobScript::new(synthesize_fallback_script(&job.job_id));
                    write_job_files(job_dir, &fallback)?;
                }
                Ok(JobScript::DEFAULT_ENTRYPOINT.to_string())
            }
        }
    }

    /// Build the execution image. The tag is derived from the job id so
    /// rebuilds of the same job land on the same tag. Build failure is
    /// fatal for this attempt.
    async fn build_image(&self, job_id: &str, job_dir: &Path) -> Result<String> {
        let tag = format!("{}-{}", self.config.image_prefix, job_id.to_lowercase());
        tracing::info!(job_id, tag = %tag, "Building execution image");

        let output = Command::new("docker")
            .args(["build", "-t", &tag, "."])
            .current_dir(job_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(YardError::Docker(format!("image build failed: {stderr}")));
        }
        Ok(tag)
    }

    /// Run the image with an isolated writable output mount, forwarding
    /// the combined output stream line-by-line and sampling host usage
    /// until the process exits. The sampler is cancelled and joined before
    /// this returns; it never outlives the run.
    async fn run_container(&self, tag: &str, output_dir: &Path, job_id: &str) -> Result<()> {
        let mount = format!(
            "{}:/workspace/output",
            std::fs::canonicalize(output_dir)?.display()
        );

        let mut child = Command::new("docker")
            .args(["run", "--rm", "-v", &mount, tag])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let sampler_token = CancellationToken::new();
        let sampler = self.spawn_usage_sampler(job_id.to_string(), sampler_token.clone());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| self.spawn_log_forwarder(job_id.to_string(), s));
        let err_task = stderr.map(|s| self.spawn_log_forwarder(job_id.to_string(), s));

        let status = child.wait().await?;
        tracing::info!(job_id, code = ?status.code(), "Container exited");

        // Drain the forwarders, then stop the sampler with a bounded join
        // so it cannot leak into the next job.
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }
        sampler_token.cancel();
        if tokio::time::timeout(std::time::Duration::from_secs(2), sampler)
            .await
            .is_err()
        {
            tracing::warn!(job_id, "Usage sampler did not stop in time");
        }

        Ok(())
    }

    /// Forward one output stream to the backend, line by line, as the
    /// lines arrive. Forwarding failures are logged locally and never
    /// abort the run.
    fn spawn_log_forwarder<R>(
        &self,
        job_id: String,
        stream: R,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(job_id = %job_id, line = %line, "container");
                if let Err(e) = client.stream_log(&job_id, &line).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Log forward failed");
                }
            }
        })
    }

    fn spawn_usage_sampler(
        &self,
        job_id: String,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let node_id = self.node_id.clone();
        let interval = self.config.usage_sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snap = sysprobe::sample_usage();
                        let report = UsageReportRequest {
                            node_id: node_id.clone(),
                            job_id: job_id.clone(),
                            cpu_percent: snap.cpu_percent,
                            ram_percent: snap.ram_percent,
                            ts: Utc::now().timestamp(),
                        };
                        if let Err(e) = client.report_usage(&report).await {
                            tracing::debug!(job_id = %job_id, error = %e, "Usage report failed");
                        }
                    }
                }
            }
        })
    }
}

/// Write the script (and optional dependency manifest) into the build
/// context under the script's entrypoint name.
pub fn write_job_files(job_dir: &Path, script: &JobScript) -> std::io::Result<()> {
    std::fs::create_dir_all(job_dir)?;
    std::fs::write(job_dir.join(&script.entrypoint), &script.script)?;
    if let Some(reqs) = &script.requirements {
        if !reqs.trim().is_empty() {
            std::fs::write(job_dir.join("requirements.txt"), reqs)?;
        }
    }
    Ok(())
}

/// Minimal deterministic program for jobs with no renter script: writes a
/// placeholder artifact so the run still produces something to hash.
pub fn synthesize_fallback_script(job_id: &str) -> String {
    let marker = job_id.replace('-', "");
    format!(
        r#"import os

os.makedirs("output", exist_ok=True)
with open("output/model.bin", "wb") as f:
    f.write(b"placeholder-model-{marker}")
print("fallback training: wrote placeholder model to output/model.bin")
"#
    )
}

/// Build descriptor for the execution image: installs declared
/// dependencies best-effort (install failures are swallowed) and runs the
/// entrypoint.
pub fn write_dockerfile(job_dir: &Path, entrypoint: &str) -> std::io::Result<()> {
    let dockerfile = format!(
        r#"FROM python:3.10-slim
WORKDIR /workspace
COPY . /workspace
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt || true; fi
CMD ["python", "{entrypoint}"]
"#
    );
    std::fs::write(job_dir.join("Dockerfile"), dockerfile)
}

/// Pick the artifact to hash from the output mount.
///
/// The heuristic is load-bearing for what gets hashed: a file whose name
/// matches the canonical set (`model.bin`, `pytorch_model.bin`,
/// `model.pt`, `model.pth`) takes precedence regardless of size;
/// otherwise the largest file by byte size wins, first encountered on
/// ties. An empty directory means no model was produced, which is not an
/// error.
pub fn select_artifact(output_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut files: Vec<(String, u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        files.push((name, meta.len(), entry.path()));
    }
    if files.is_empty() {
        return Ok(None);
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    if let Some((_, _, path)) = files
        .iter()
        .find(|(name, _, _)| CANONICAL_ARTIFACTS.contains(&name.to_lowercase().as_str()))
    {
        return Ok(Some(path.clone()));
    }

    let mut best: Option<&(String, u64, PathBuf)> = None;
    for file in &files {
        match best {
            Some(b) if file.1 <= b.1 => {}
            _ => best = Some(file),
        }
    }
    Ok(best.map(|(_, _, path)| path.clone()))
}

/// Streaming digest over the artifact's bytes in fixed-size chunks.
/// Returns the hex digest and the size in bytes.
pub fn hash_artifact(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "trainyard-runner-{}-{}",
            tag,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn canonical_name_beats_larger_file() {
        let dir = temp_dir("canonical");
        std::fs::write(dir.join("a.txt"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("model.bin"), vec![0u8; 5]).unwrap();

        let picked = select_artifact(&dir).unwrap().unwrap();
        assert_eq!(picked.file_name().unwrap(), "model.bin");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn largest_file_wins_without_canonical_name() {
        let dir = temp_dir("largest");
        std::fs::write(dir.join("a.txt"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("b.bin"), vec![0u8; 50]).unwrap();

        let picked = select_artifact(&dir).unwrap().unwrap();
        assert_eq!(picked.file_name().unwrap(), "b.bin");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_output_dir_is_no_model() {
        let dir = temp_dir("empty");
        assert!(select_artifact(&dir).unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn hashing_is_deterministic_and_byte_sensitive() {
        let dir = temp_dir("hash");
        let path = dir.join("model.bin");
        std::fs::write(&path, b"weights").unwrap();

        let (first, size) = hash_artifact(&path).unwrap();
        let (second, _) = hash_artifact(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(size, 7);

        std::fs::write(&path, b"weightz").unwrap();
        let (changed, _) = hash_artifact(&path).unwrap();
        assert_ne!(first, changed);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fallback_script_is_deterministic_per_job() {
        let a = synthesize_fallback_script("job-1");
        assert_eq!(a, synthesize_fallback_script("job-1"));
        assert_ne!(a, synthesize_fallback_script("job-2"));
        assert!(a.contains("output/model.bin"));
        assert!(a.contains("job1"));
    }

    #[test]
    fn dockerfile_runs_entrypoint_and_tolerates_missing_requirements() {
        let dir = temp_dir("dockerfile");
        write_dockerfile(&dir, "train.py").unwrap();
        let content = std::fs::read_to_string(dir.join("Dockerfile")).unwrap();
        assert!(content.contains("CMD [\"python\", \"train.py\"]"));
        assert!(content.contains("|| true"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn job_files_skip_empty_requirements() {
        let dir = temp_dir("files");
        let mut script = JobScript::new("print('hi')");
        script.requirements = Some("  ".to_string());
        write_job_files(&dir, &script).unwrap();
        assert!(dir.join("train.py").exists());
        assert!(!dir.join("requirements.txt").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
