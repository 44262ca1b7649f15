//! Process configuration from the environment

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use runbox_core::{Language, LimitsPolicy, RunLimits};
use runbox_sandbox::ContainerConfig;

use crate::auth::Tenant;

const DEFAULT_RATE: f64 = 5.0;
const DEFAULT_BURST: f64 = 10.0;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub api_keys: Vec<Tenant>,
    /// Per-run workdir root, shared storage visible to both the orchestrator
    /// and the container engine.
    pub work_root: PathBuf,
    /// Root of the content-addressed store.
    pub storage_root: PathBuf,
    /// Base used when minting signed links and subscription hints.
    pub public_base_url: String,
    /// HMAC signing key (hex-encoded in the environment).
    pub signing_key: Vec<u8>,
    pub url_ttl_secs: u64,
    pub limits: LimitsPolicy,
    pub container: ContainerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port = env_or("RUNBOX_PORT", "8080")
            .parse()
            .context("invalid RUNBOX_PORT")?;

        let api_keys = parse_api_keys(&env_or("RUNBOX_API_KEYS", ""))?;
        if api_keys.is_empty() {
            bail!("RUNBOX_API_KEYS must configure at least one key (token:label:rps:burst)");
        }

        let signing_key = hex::decode(
            env::var("RUNBOX_SIGNING_KEY")
                .context("RUNBOX_SIGNING_KEY must be set (hex-encoded HMAC key)")?,
        )
        .context("invalid RUNBOX_SIGNING_KEY hex encoding")?;

        let limits = LimitsPolicy {
            defaults: limits_with(env_lookup, RunLimits::default(), "RUNBOX_DEFAULT")?,
            maxima: limits_with(env_lookup, RunLimits::default_maxima(), "RUNBOX_MAX")?,
        };

        let mut container = ContainerConfig {
            cli: env_or("RUNBOX_CONTAINER_CLI", "docker"),
            seccomp_profile: env::var("RUNBOX_SECCOMP_PROFILE").ok().map(PathBuf::from),
            apparmor_profile: env::var("RUNBOX_APPARMOR_PROFILE").ok(),
            disable_security: flag_enabled(&env_or("RUNBOX_DISABLE_SANDBOX_SECURITY", "")),
            ..ContainerConfig::default()
        };
        for language in Language::ALL {
            let var = format!("RUNBOX_IMAGE_{}", language.as_str().to_uppercase());
            if let Ok(image) = env::var(&var) {
                container.images.insert(language, image);
            }
        }

        let public_base_url = env_or("RUNBOX_PUBLIC_BASE_URL", &format!("http://localhost:{port}"));

        Ok(Self {
            port,
            api_keys,
            work_root: PathBuf::from(env_or("RUNBOX_WORK_ROOT", "/srv/runbox/work")),
            storage_root: PathBuf::from(env_or("RUNBOX_STORAGE_ROOT", "/srv/runbox/storage")),
            public_base_url,
            signing_key,
            url_ttl_secs: env_or("RUNBOX_URL_TTL_SECS", "600")
                .parse()
                .context("invalid RUNBOX_URL_TTL_SECS")?,
            limits,
            container,
        })
    }

    /// Token-indexed view of the configured keys.
    pub fn tenants(&self) -> HashMap<String, Tenant> {
        self.api_keys
            .iter()
            .map(|t| (t.token.clone(), t.clone()))
            .collect()
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn flag_enabled(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

/// Parse `token:label:rps:burst` entries; rate and burst may be omitted.
fn parse_api_keys(raw: &str) -> Result<Vec<Tenant>> {
    let mut keys = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        let tenant = match parts.as_slice() {
            [token, label] => Tenant {
                token: token.to_string(),
                label: label.to_string(),
                rate: DEFAULT_RATE,
                burst: DEFAULT_BURST,
            },
            [token, label, rate, burst] => Tenant {
                token: token.to_string(),
                label: label.to_string(),
                rate: rate
                    .parse()
                    .with_context(|| format!("invalid rps in API key entry {entry:?}"))?,
                burst: burst
                    .parse()
                    .with_context(|| format!("invalid burst in API key entry {entry:?}"))?,
            },
            _ => bail!("malformed API key entry {entry:?}, expected token:label:rps:burst"),
        };
        if tenant.token.is_empty() {
            bail!("API key entry {entry:?} has an empty token");
        }
        keys.push(tenant);
    }
    Ok(keys)
}

/// Apply `<prefix>_<FIELD>` overrides to a limits record.
fn limits_with(
    lookup: impl Fn(&str) -> Option<String>,
    base: RunLimits,
    prefix: &str,
) -> Result<RunLimits> {
    let field = |name: &str, current: u64| -> Result<u64> {
        let var = format!("{prefix}_{}", name.to_uppercase());
        match lookup(&var) {
            Some(raw) => raw.parse().with_context(|| format!("invalid {var}")),
            None => Ok(current),
        }
    };
    Ok(RunLimits {
        timeout_ms: field("timeout_ms", base.timeout_ms)?,
        memory_mb: field("memory_mb", base.memory_mb)?,
        cpu_ms: field("cpu_ms", base.cpu_ms)?,
        max_output_bytes: field("max_output_bytes", base.max_output_bytes)?,
        max_artifact_bytes: field("max_artifact_bytes", base.max_artifact_bytes)?,
        max_artifact_files: field("max_artifact_files", base.max_artifact_files)?,
    })
}
