//! Run orchestration pipeline
//!
//! Drives a validated request through staging, sandbox launch, supervision,
//! result collection, and artifact persistence. All per-run mutable state
//! lives in one workdir created and destroyed here; the workdir teardown
//! runs unconditionally on success and failure paths, and the run store only
//! sees a record after teardown has happened.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};

use runbox_core::{
    code_sha256, run_id, sanitize_env, ArtifactDescriptor, Error, LimitsPolicy, Result, RunLimits,
    RunRecord, RunRequest, RunStatus, StagedFile, Usage, MAX_CODE_BYTES,
};
use runbox_sandbox::{read_usage_file, RunSpec, SandboxRunner};
use runbox_storage::{ArtifactStore, RunStore};

use crate::stream::Progress;

/// Largest single staged input file.
const MAX_STAGED_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// Largest cumulative staged input size per run.
const MAX_STAGED_TOTAL_BYTES: u64 = 25 * 1024 * 1024;

pub struct Orchestrator {
    runner: Arc<dyn SandboxRunner>,
    store: Arc<ArtifactStore>,
    runs: Arc<RunStore>,
    limits: LimitsPolicy,
    work_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn SandboxRunner>,
        store: Arc<ArtifactStore>,
        runs: Arc<RunStore>,
        limits: LimitsPolicy,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            store,
            runs,
            limits,
            work_root: work_root.into(),
        }
    }

    /// Admission-time validation: the checks a request must pass before a
    /// run id is handed out. Shared by the synchronous and streaming paths.
    pub fn precheck(&self, request: &RunRequest) -> Result<RunLimits> {
        validate(request)?;
        self.limits.merge(&request.limits)
    }

    /// Run a request to completion and return the stored record. The run id
    /// is minted only after the request passes admission checks.
    pub async fn create_run(&self, request: RunRequest) -> Result<RunRecord> {
        self.precheck(&request)?;
        self.execute(run_id(), request, None).await
    }

    /// The full pipeline for a pre-minted run id. The streaming path passes
    /// a [`Progress`] handle; the synchronous path passes `None`.
    pub async fn execute(
        &self,
        run_id: String,
        request: RunRequest,
        progress: Option<Progress>,
    ) -> Result<RunRecord> {
        validate(&request)?;
        let limits = self.limits.merge(&request.limits)?;

        let workdir = self.work_root.join(&run_id);
        let outcome = self
            .run_in_workdir(&run_id, &request, &limits, &workdir, progress)
            .await;

        // Unconditional teardown; failures are logged, never propagated.
        if let Err(e) = fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run_id = %run_id, error = %e, "failed to remove workdir");
            }
        }

        let record = outcome?;
        self.runs.insert(record.clone()).await;
        info!(
            run_id = %record.id,
            language = %record.language,
            status = ?record.status,
            wall_ms = record.usage.wall_ms,
            "run finished"
        );
        Ok(record)
    }

    async fn run_in_workdir(
        &self,
        run_id: &str,
        request: &RunRequest,
        limits: &RunLimits,
        workdir: &Path,
        progress: Option<Progress>,
    ) -> Result<RunRecord> {
        fs::create_dir_all(workdir.join("inputs")).await?;
        fs::create_dir_all(workdir.join("outputs")).await?;

        if let Some(p) = &progress {
            p.stage("staging").await;
        }
        self.stage_inputs(&request.files, workdir).await?;

        let code_sha256 = code_sha256(&request.code);
        let env = sanitize_env(&request.env);

        let spec = RunSpec {
            run_id: run_id.to_string(),
            language: request.language,
            code: request.code.clone(),
            args: request.args.clone(),
            env,
            workdir: workdir.to_path_buf(),
            limits: limits.clone(),
            staged_files: request.files.clone(),
        };

        let (sink, forwarder) = match &progress {
            Some(p) => {
                p.stage("running").await;
                let (sink, forwarder) = p.sandbox_sink();
                (Some(sink), Some(forwarder))
            }
            None => (None, None),
        };

        debug!(run_id, runner = self.runner.name(), "invoking sandbox");
        let result = self.runner.run(&spec, sink).await?;
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }

        // Trust the sandbox's status except for the one inconsistency it
        // cannot claim: success with a nonzero exit code.
        let mut status = result.status;
        if status == RunStatus::Succeeded && result.exit_code.unwrap_or(0) != 0 {
            status = RunStatus::Failed;
        }

        if let Some(p) = &progress {
            p.stage("collecting").await;
        }
        let artifacts = self
            .collect_artifacts(workdir, &result.artifacts, limits)
            .await;

        let usage = match result.usage {
            Some(usage) => usage,
            None => read_usage_file(workdir)
                .await
                .unwrap_or_else(|| Usage::upper_bound(limits)),
        };

        Ok(RunRecord {
            id: run_id.to_string(),
            status,
            exit_code: result.exit_code,
            stdout: truncate_stream(result.stdout, limits.max_output_bytes),
            stderr: truncate_stream(result.stderr, limits.max_output_bytes),
            usage,
            artifacts,
            limits: limits.clone(),
            created_at: Utc::now(),
            language: request.language,
            code_sha256,
        })
    }

    /// Copy requested uploads into `inputs/`, enforcing the staging caps.
    async fn stage_inputs(&self, files: &[StagedFile], workdir: &Path) -> Result<()> {
        let mut total = 0u64;
        for staged in files {
            let dest_rel = Path::new(&staged.path);
            let escapes = dest_rel.is_absolute()
                || dest_rel
                    .components()
                    .any(|c| matches!(c, Component::ParentDir));
            if escapes || staged.path.is_empty() {
                return Err(Error::Validation(format!(
                    "invalid staging path {:?}",
                    staged.path
                )));
            }

            let file = self.store.lookup_upload(&staged.id).await?;
            if file.size > MAX_STAGED_FILE_BYTES {
                return Err(Error::Validation(format!(
                    "staged file {} exceeds the 10 MiB single-file cap",
                    staged.id
                )));
            }
            total += file.size;
            if total > MAX_STAGED_TOTAL_BYTES {
                return Err(Error::Validation(
                    "staged files exceed the 25 MiB cumulative cap".to_string(),
                ));
            }

            let dest = workdir.join("inputs").join(dest_rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&file.path, &dest).await?;
            debug!(file_id = %staged.id, path = %staged.path, "staged input");
        }
        Ok(())
    }

    /// Move surviving candidates into the artifact store. Paths outside the
    /// run's `outputs/` are dropped; collection stops once either cap would
    /// be exceeded. Ingestion failures drop the entry, never the run.
    async fn collect_artifacts(
        &self,
        workdir: &Path,
        candidates: &[PathBuf],
        limits: &RunLimits,
    ) -> Vec<ArtifactDescriptor> {
        let outputs = workdir.join("outputs");
        let mut collected = Vec::new();
        let mut total_bytes = 0u64;

        for path in candidates {
            if !path.starts_with(&outputs) {
                debug!(path = %path.display(), "dropping artifact outside outputs/");
                continue;
            }
            let Ok(meta) = fs::metadata(path).await else {
                continue;
            };
            if collected.len() as u64 >= limits.max_artifact_files {
                break;
            }
            if total_bytes + meta.len() > limits.max_artifact_bytes {
                break;
            }
            let name = match path.strip_prefix(&outputs) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            match self.store.ingest_artifact(path, &name).await {
                Ok(descriptor) => {
                    total_bytes += descriptor.size;
                    collected.push(descriptor);
                }
                Err(e) => {
                    warn!(name, error = %e, "dropping artifact that failed ingestion");
                }
            }
        }
        collected
    }
}

fn validate(request: &RunRequest) -> Result<()> {
    if request.code.is_empty() {
        return Err(Error::Validation("code must not be empty".to_string()));
    }
    if request.code.len() > MAX_CODE_BYTES {
        return Err(Error::Validation(format!(
            "code exceeds the {} KiB cap",
            MAX_CODE_BYTES / 1024
        )));
    }
    Ok(())
}

/// Byte truncation happens before the lossy UTF-8 decode; the decoded
/// length is not re-checked.
fn truncate_stream(mut bytes: Vec<u8>, cap: u64) -> String {
    bytes.truncate(cap as usize);
    String::from_utf8_lossy(&bytes).into_owned()
}
