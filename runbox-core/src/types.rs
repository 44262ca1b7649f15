//! Run and file records exchanged across the gateway

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::limits::{LimitsOverride, RunLimits};

/// Maximum accepted code body size in bytes.
pub const MAX_CODE_BYTES: usize = 200 * 1024;

/// Supported execution targets. Every other language tag is rejected at
/// admission; additions are configuration (a sandbox image identifier), not
/// new code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Ruby,
    Php,
    Go,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Node,
        Language::Ruby,
        Language::Php,
        Language::Go,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "node",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Go => "go",
        }
    }

    /// Conventional entry-file name the sandbox materializes the code into.
    pub fn entry_file(self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Node => "main.js",
            Language::Ruby => "main.rb",
            Language::Php => "main.php",
            Language::Go => "main.go",
        }
    }

    /// Whether the bootstrap runs a compile phase before execution.
    pub fn compiled(self) -> bool {
        matches!(self, Language::Go)
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the request's file-staging list: an uploaded-file id paired
/// with a relative destination under the sandbox input directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub id: String,
    pub path: String,
}

/// A validated run submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: Language,
    pub code: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub files: Vec<StagedFile>,
    #[serde(default)]
    pub limits: LimitsOverride,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RunRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            args: Vec::new(),
            files: Vec::new(),
            limits: LimitsOverride::default(),
            env: HashMap::new(),
        }
    }
}

/// Externally visible outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Timeout,
    Oom,
    Killed,
}

/// Observed resource consumption for one run.
///
/// `compile_ms` is reported only by compiled languages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub max_rss_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_ms: Option<u64>,
}

impl Usage {
    /// Conservative upper bound derived from the effective limits, used when
    /// the sandbox was killed before it could write `usage.json`.
    pub fn upper_bound(limits: &RunLimits) -> Self {
        Self {
            wall_ms: limits.timeout_ms,
            cpu_ms: limits.cpu_ms,
            max_rss_mb: limits.memory_mb,
            compile_ms: None,
        }
    }
}

/// A file produced by a run, persisted in the artifact store and reachable
/// only through its signed URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    pub url: String,
    /// UNIX seconds after which the signed URL stops verifying.
    pub expires_at: u64,
    pub content_type: String,
}

/// The record returned to the caller and stored by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub usage: Usage,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub limits: RunLimits,
    pub created_at: DateTime<Utc>,
    pub language: Language,
    pub code_sha256: String,
}

/// An uploaded file held in the store. The on-disk path is reconstructed
/// from the store layout and never serialized; the remaining fields are the
/// sidecar metadata that survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub sha256: String,
    pub content_type: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Hex SHA-256 of a code body. Computed once per run.
pub fn code_sha256(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}
