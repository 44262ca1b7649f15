//! Core types for the Runbox code-execution gateway
//!
//! Everything the other crates agree on lives here: the supported language
//! set, resource limits and the policy that clamps them, run and file
//! records, id minting, environment sanitization, and the shared error type.

mod env;
mod error;
mod id;
mod limits;
mod types;

pub use env::sanitize_env;
pub use error::{Error, Result};
pub use id::{file_id, run_id};
pub use limits::{LimitsOverride, LimitsPolicy, RunLimits};
pub use types::{
    code_sha256, ArtifactDescriptor, Language, RunRecord, RunRequest, RunStatus, StagedFile,
    StoredFile, Usage, MAX_CODE_BYTES,
};
