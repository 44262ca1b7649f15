//! Run specification and sandbox result types

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use runbox_core::{Language, RunLimits, RunStatus, StagedFile, Usage};

/// A fully prepared run handed to a sandbox runner: everything is resolved
/// and sanitized before this struct exists.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: String,
    pub language: Language,
    pub code: String,
    pub args: Vec<String>,
    /// Sanitized environment (see `runbox_core::sanitize_env`).
    pub env: HashMap<String, String>,
    /// Per-run directory shared between orchestrator and sandbox, mounted
    /// at `/work` inside the container.
    pub workdir: PathBuf,
    pub limits: RunLimits,
    pub staged_files: Vec<StagedFile>,
}

/// What a sandbox runner produces for one completed run.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Usage as observed by the runner, if any. The orchestrator falls back
    /// to the workdir's `usage.json`, then to limit-derived upper bounds.
    pub usage: Option<Usage>,
    /// Candidate artifact paths, in directory-iteration order. The
    /// orchestrator drops anything outside the run's `outputs/` directory
    /// and enforces the artifact caps.
    pub artifacts: Vec<PathBuf>,
}

impl SandboxResult {
    /// A clean exit with the given stdout.
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
            usage: None,
            artifacts: Vec::new(),
        }
    }

    /// A result classified from an observed exit code.
    pub fn exited(code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status: classify_exit(code),
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            usage: None,
            artifacts: Vec::new(),
        }
    }
}

/// The single JSON object delivered on the bootstrap's standard input. The
/// child reads this before executing user code.
#[derive(Debug, Serialize)]
pub struct BootstrapSpec<'a> {
    pub id: &'a str,
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub limits: &'a RunLimits,
}

/// Map an observed exit code to the reported run status.
///
/// 124 is the bootstrap's self-detected timeout; 137 is SIGKILL from the
/// OOM killer.
pub fn classify_exit(code: i32) -> RunStatus {
    match code {
        0 => RunStatus::Succeeded,
        124 => RunStatus::Timeout,
        137 => RunStatus::Oom,
        _ => RunStatus::Failed,
    }
}

/// `usage.json` as written by the bootstrap before exit.
#[derive(Debug, Deserialize)]
struct UsageFile {
    #[serde(default)]
    wall_ms: u64,
    #[serde(default)]
    cpu_ms: u64,
    #[serde(default)]
    max_rss_mb: u64,
    #[serde(default)]
    compile_ms: Option<u64>,
}

/// Read the usage file the bootstrap leaves in the workdir. `None` when the
/// sandbox was killed before it could finalize — the common case for
/// timeouts and OOM kills.
pub async fn read_usage_file(workdir: &Path) -> Option<Usage> {
    let raw = tokio::fs::read(workdir.join("usage.json")).await.ok()?;
    let parsed: UsageFile = serde_json::from_slice(&raw).ok()?;
    Some(Usage {
        wall_ms: parsed.wall_ms,
        cpu_ms: parsed.cpu_ms,
        max_rss_mb: parsed.max_rss_mb,
        compile_ms: parsed.compile_ms,
    })
}
