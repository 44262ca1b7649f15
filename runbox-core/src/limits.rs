//! Resource limits and the policy that clamps caller overrides

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Effective resource limits applied to one run.
///
/// Produced by [`LimitsPolicy::merge`] and treated as immutable downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    /// Wall-clock timeout in milliseconds.
    pub timeout_ms: u64,
    /// Memory cap in MiB.
    pub memory_mb: u64,
    /// CPU quota in milliseconds.
    pub cpu_ms: u64,
    /// Maximum captured bytes per output stream.
    pub max_output_bytes: u64,
    /// Maximum aggregate artifact bytes per run.
    pub max_artifact_bytes: u64,
    /// Maximum number of collected artifacts per run.
    pub max_artifact_files: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_mb: 256,
            cpu_ms: 5_000,
            max_output_bytes: 1024 * 1024,
            max_artifact_bytes: 10 * 1024 * 1024,
            max_artifact_files: 10,
        }
    }
}

impl RunLimits {
    /// Hard per-installation maxima used when no override is configured.
    pub fn default_maxima() -> Self {
        Self {
            timeout_ms: 60_000,
            memory_mb: 1024,
            cpu_ms: 60_000,
            max_output_bytes: 10 * 1024 * 1024,
            max_artifact_bytes: 100 * 1024 * 1024,
            max_artifact_files: 50,
        }
    }
}

/// Caller-supplied partial limits. Missing fields take the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsOverride {
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_ms: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub max_artifact_bytes: Option<u64>,
    pub max_artifact_files: Option<u64>,
}

/// Per-installation limits policy: defaults plus hard maxima.
#[derive(Debug, Clone)]
pub struct LimitsPolicy {
    pub defaults: RunLimits,
    pub maxima: RunLimits,
}

impl Default for LimitsPolicy {
    fn default() -> Self {
        Self {
            defaults: RunLimits::default(),
            maxima: RunLimits::default_maxima(),
        }
    }
}

impl LimitsPolicy {
    /// Clamp a caller override against this policy.
    ///
    /// Missing fields take the defaults. A zero field or a field above its
    /// maximum fails the request with a validation error naming the field.
    pub fn merge(&self, overrides: &LimitsOverride) -> Result<RunLimits> {
        Ok(RunLimits {
            timeout_ms: clamp(
                "timeout_ms",
                overrides.timeout_ms,
                self.defaults.timeout_ms,
                self.maxima.timeout_ms,
            )?,
            memory_mb: clamp(
                "memory_mb",
                overrides.memory_mb,
                self.defaults.memory_mb,
                self.maxima.memory_mb,
            )?,
            cpu_ms: clamp(
                "cpu_ms",
                overrides.cpu_ms,
                self.defaults.cpu_ms,
                self.maxima.cpu_ms,
            )?,
            max_output_bytes: clamp(
                "max_output_bytes",
                overrides.max_output_bytes,
                self.defaults.max_output_bytes,
                self.maxima.max_output_bytes,
            )?,
            max_artifact_bytes: clamp(
                "max_artifact_bytes",
                overrides.max_artifact_bytes,
                self.defaults.max_artifact_bytes,
                self.maxima.max_artifact_bytes,
            )?,
            max_artifact_files: clamp(
                "max_artifact_files",
                overrides.max_artifact_files,
                self.defaults.max_artifact_files,
                self.maxima.max_artifact_files,
            )?,
        })
    }
}

fn clamp(field: &str, requested: Option<u64>, default: u64, max: u64) -> Result<u64> {
    let value = requested.unwrap_or(default);
    if value == 0 {
        return Err(Error::Validation(format!("limit {field} must be positive")));
    }
    if value > max {
        return Err(Error::Validation(format!(
            "limit {field} exceeds maximum of {max}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_override_yields_defaults() {
        let policy = LimitsPolicy::default();
        let merged = policy.merge(&LimitsOverride::default()).unwrap();
        assert_eq!(merged, policy.defaults);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let policy = LimitsPolicy::default();
        let overrides = LimitsOverride {
            timeout_ms: Some(1_000),
            memory_mb: Some(128),
            ..Default::default()
        };
        let once = policy.merge(&overrides).unwrap();
        let again = policy
            .merge(&LimitsOverride {
                timeout_ms: Some(once.timeout_ms),
                memory_mb: Some(once.memory_mb),
                cpu_ms: Some(once.cpu_ms),
                max_output_bytes: Some(once.max_output_bytes),
                max_artifact_bytes: Some(once.max_artifact_bytes),
                max_artifact_files: Some(once.max_artifact_files),
            })
            .unwrap();
        assert_eq!(once, again);
    }

    #[test]
    fn test_lowering_is_allowed() {
        let policy = LimitsPolicy::default();
        let merged = policy
            .merge(&LimitsOverride {
                timeout_ms: Some(1_000),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(merged.timeout_ms, 1_000);
        assert_eq!(merged.memory_mb, policy.defaults.memory_mb);
    }

    #[test]
    fn test_exceeding_maximum_names_the_field() {
        let policy = LimitsPolicy::default();
        let err = policy
            .merge(&LimitsOverride {
                memory_mb: Some(policy.maxima.memory_mb + 1),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("memory_mb"));
    }

    #[test]
    fn test_zero_is_rejected() {
        let policy = LimitsPolicy::default();
        let err = policy
            .merge(&LimitsOverride {
                timeout_ms: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_maximum_itself_is_accepted() {
        let policy = LimitsPolicy::default();
        let merged = policy
            .merge(&LimitsOverride {
                timeout_ms: Some(policy.maxima.timeout_ms),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(merged.timeout_ms, policy.maxima.timeout_ms);
    }
}
