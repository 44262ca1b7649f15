//! Container-backed sandbox runner
//!
//! Launches one ephemeral container per run through the configured container
//! CLI. Isolation is enforced at the container boundary: no network, a
//! read-only root filesystem with the workdir bind-mounted at `/work` as the
//! only writable area, dropped capabilities, no-new-privileges, a seccomp
//! profile and optional AppArmor profile, a bounded pid count, and memory and
//! CPU caps from the effective limits. The wall-clock timer here is the
//! authoritative deadline; on expiry the container is killed and the run is
//! reported as a timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use runbox_core::{Error, Language, Result, RunStatus};

use crate::runner::{EventSink, SandboxEvent, SandboxRunner};
use crate::spec::{classify_exit, BootstrapSpec, RunSpec, SandboxResult};

/// Operator configuration for the container runner.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container CLI binary (`docker` unless overridden).
    pub cli: String,
    /// Per-language sandbox image identifiers.
    pub images: HashMap<Language, String>,
    /// Seccomp profile path passed as `--security-opt seccomp=<path>`.
    pub seccomp_profile: Option<PathBuf>,
    /// AppArmor profile name passed as `--security-opt apparmor=<name>`.
    pub apparmor_profile: Option<String>,
    /// Development flag: skip the seccomp/AppArmor arguments. Network,
    /// read-only root, and capability drops stay on even then.
    pub disable_security: bool,
    /// Process count bound inside the sandbox.
    pub pids_limit: u32,
    /// Extra wall-clock allowance for container startup and the compile
    /// phase of compiled languages, on top of the run's `timeout_ms`.
    pub startup_grace_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let images = Language::ALL
            .iter()
            .map(|lang| (*lang, format!("runbox-runner-{lang}:latest")))
            .collect();
        Self {
            cli: "docker".to_string(),
            images,
            seccomp_profile: None,
            apparmor_profile: None,
            disable_security: false,
            pids_limit: 256,
            startup_grace_ms: 10_000,
        }
    }
}

pub struct ContainerRunner {
    config: ContainerConfig,
}

impl ContainerRunner {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// The full `run` argument vector for one spec. Pure so the isolation
    /// flag set stays testable without a container engine.
    fn run_args(&self, spec: &RunSpec, image: &str, name: &str) -> Vec<String> {
        let limits = &spec.limits;
        let mut args: Vec<String> = [
            "run",
            "--rm",
            "-i",
            "--name",
            name,
            "--network",
            "none",
            "--read-only",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if !self.config.disable_security {
            if let Some(profile) = &self.config.seccomp_profile {
                args.push("--security-opt".to_string());
                args.push(format!("seccomp={}", profile.display()));
            }
            if let Some(profile) = &self.config.apparmor_profile {
                args.push("--security-opt".to_string());
                args.push(format!("apparmor={profile}"));
            }
        }

        args.push("--pids-limit".to_string());
        args.push(self.config.pids_limit.to_string());
        args.push("--memory".to_string());
        args.push(format!("{}m", limits.memory_mb));
        // No swap headroom past the cap: the OOM killer fires at memory_mb.
        args.push("--memory-swap".to_string());
        args.push(format!("{}m", limits.memory_mb));
        let cpus = limits.cpu_ms as f64 / 1000.0;
        args.push("--cpus".to_string());
        args.push(format!("{cpus}"));

        args.push("-v".to_string());
        args.push(format!("{}:/work", spec.workdir.display()));
        args.push("-w".to_string());
        args.push("/work".to_string());

        args.push(image.to_string());
        args.push(spec.language.entry_file().to_string());
        args.push("--".to_string());
        args.extend(spec.args.iter().cloned());

        args
    }

    async fn kill_container(&self, name: &str) {
        let result = Command::new(&self.config.cli)
            .args(["kill", name])
            .output()
            .await;
        if let Err(e) = result {
            warn!(container = name, error = %e, "failed to kill container");
        }
    }
}

#[async_trait]
impl SandboxRunner for ContainerRunner {
    async fn run(&self, spec: &RunSpec, sink: Option<EventSink>) -> Result<SandboxResult> {
        let image = self.config.images.get(&spec.language).ok_or_else(|| {
            Error::Sandbox(format!("no sandbox image configured for {}", spec.language))
        })?;

        // Materialize the code under its conventional entry-file name before
        // the workdir is mounted.
        tokio::fs::write(spec.workdir.join(spec.language.entry_file()), &spec.code).await?;

        let name = format!("runbox-{}", spec.run_id);
        let args = self.run_args(spec, image, &name);
        debug!(run_id = %spec.run_id, image, "launching sandbox container");

        let mut child = Command::new(&self.config.cli)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to launch sandbox: {e}")))?;

        // Deliver the bootstrap spec on the child's stdin, then close it so
        // the bootstrap sees EOF after the single JSON object.
        let bootstrap = serde_json::to_vec(&BootstrapSpec {
            id: &spec.run_id,
            args: &spec.args,
            env: &spec.env,
            limits: &spec.limits,
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sandbox("sandbox stdin unavailable".to_string()))?;
        stdin
            .write_all(&bootstrap)
            .await
            .map_err(|e| Error::Sandbox(format!("failed to deliver bootstrap spec: {e}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to close sandbox stdin: {e}")))?;
        drop(stdin);

        let cap = spec.limits.max_output_bytes as usize;
        let stdout_task = capture(child.stdout.take(), cap, sink.clone(), StreamKind::Stdout);
        let stderr_task = capture(child.stderr.take(), cap, sink, StreamKind::Stderr);

        let deadline =
            Duration::from_millis(spec.limits.timeout_ms + self.config.startup_grace_ms);
        let mut timed_out = false;
        let wait_status = match timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                self.kill_container(&name).await;
                return Err(Error::Sandbox(format!("failed waiting for sandbox: {e}")));
            }
            Err(_) => {
                timed_out = true;
                self.kill_container(&name).await;
                let _ = child.kill().await;
                let _ = child.wait().await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let (status, exit_code) = if timed_out {
            (RunStatus::Timeout, None)
        } else {
            match wait_status.and_then(|s| s.code()) {
                Some(code) => (classify_exit(code), Some(code)),
                // Terminated by a signal outside our timer: administrative
                // kill.
                None => (RunStatus::Killed, None),
            }
        };

        let artifacts = collect_candidates(spec.workdir.join("outputs")).await;
        debug!(
            run_id = %spec.run_id,
            ?status,
            exit_code,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            candidates = artifacts.len(),
            "sandbox finished"
        );

        Ok(SandboxResult {
            status,
            exit_code,
            stdout,
            stderr,
            usage: None,
            artifacts,
        })
    }

    fn name(&self) -> &str {
        "container"
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Capture a child stream byte-accurately up to `cap`, forwarding kept
/// segments to the sink. The stream is drained past the cap so the child
/// never blocks on a full pipe.
fn capture(
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
    cap: usize,
    sink: Option<EventSink>,
    kind: StreamKind,
) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let Some(mut stream) = stream else {
            return buf;
        };
        let mut chunk = vec![0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = n.min(cap - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if let Some(sink) = &sink {
                            let segment = chunk[..take].to_vec();
                            let event = match kind {
                                StreamKind::Stdout => SandboxEvent::Stdout(segment),
                                StreamKind::Stderr => SandboxEvent::Stderr(segment),
                            };
                            let _ = sink.send(event);
                        }
                    }
                }
            }
        }
        buf
    })
}

/// Walk the outputs directory, collecting file paths in directory-iteration
/// order (depth-first).
async fn collect_candidates(outputs: PathBuf) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![outputs];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => pending.push(entry.path()),
                Ok(ft) if ft.is_file() => found.push(entry.path()),
                _ => {}
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbox_core::RunLimits;

    fn spec() -> RunSpec {
        RunSpec {
            run_id: "run_testtesttest".to_string(),
            language: Language::Python,
            code: "print(1)".to_string(),
            args: vec!["--verbose".to_string()],
            env: HashMap::new(),
            workdir: PathBuf::from("/srv/runbox/work/run_testtesttest"),
            limits: RunLimits::default(),
            staged_files: Vec::new(),
        }
    }

    fn runner_with(config: ContainerConfig) -> ContainerRunner {
        ContainerRunner::new(config)
    }

    #[test]
    fn test_isolation_flags_always_present() {
        let runner = runner_with(ContainerConfig::default());
        let args = runner.run_args(&spec(), "img", "runbox-run_testtesttest");
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--pids-limit 256"));
        assert!(joined.contains("--memory 256m"));
        assert!(joined.contains("--memory-swap 256m"));
        assert!(joined.contains("--cpus 5"));
        assert!(joined.contains("-v /srv/runbox/work/run_testtesttest:/work"));
        assert!(joined.contains("-w /work"));
    }

    #[test]
    fn test_cpu_quota_scales_with_limit() {
        let runner = runner_with(ContainerConfig::default());
        let mut spec = spec();
        spec.limits.cpu_ms = 2_500;
        let joined = runner.run_args(&spec, "img", "c").join(" ");
        assert!(joined.contains("--cpus 2.5"));

        spec.limits.cpu_ms = 10_000;
        let joined = runner.run_args(&spec, "img", "c").join(" ");
        assert!(joined.contains("--cpus 10"));
    }

    #[test]
    fn test_entry_file_and_args_separator() {
        let runner = runner_with(ContainerConfig::default());
        let args = runner.run_args(&spec(), "img", "c");
        let image_pos = args.iter().position(|a| a == "img").unwrap();
        assert_eq!(args[image_pos + 1], "main.py");
        assert_eq!(args[image_pos + 2], "--");
        assert_eq!(args[image_pos + 3], "--verbose");
    }

    #[test]
    fn test_security_profiles_applied() {
        let config = ContainerConfig {
            seccomp_profile: Some(PathBuf::from("/etc/runbox/seccomp.json")),
            apparmor_profile: Some("runbox".to_string()),
            ..Default::default()
        };
        let runner = runner_with(config);
        let joined = runner.run_args(&spec(), "img", "c").join(" ");
        assert!(joined.contains("seccomp=/etc/runbox/seccomp.json"));
        assert!(joined.contains("apparmor=runbox"));
    }

    #[test]
    fn test_disable_security_drops_profiles_only() {
        let config = ContainerConfig {
            seccomp_profile: Some(PathBuf::from("/etc/runbox/seccomp.json")),
            apparmor_profile: Some("runbox".to_string()),
            disable_security: true,
            ..Default::default()
        };
        let runner = runner_with(config);
        let joined = runner.run_args(&spec(), "img", "c").join(" ");
        assert!(!joined.contains("seccomp="));
        assert!(!joined.contains("apparmor="));
        // the rest of the contract stays on
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--cap-drop ALL"));
    }

    #[tokio::test]
    async fn test_collect_candidates_walks_nested_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let outputs = tmp.path().join("outputs");
        tokio::fs::create_dir_all(outputs.join("charts")).await.unwrap();
        tokio::fs::write(outputs.join("report.txt"), b"ok").await.unwrap();
        tokio::fs::write(outputs.join("charts/plot.png"), b"png").await.unwrap();

        let found = collect_candidates(outputs.clone()).await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.starts_with(&outputs)));
    }

    #[tokio::test]
    async fn test_collect_candidates_missing_dir_is_empty() {
        let found = collect_candidates(PathBuf::from("/nonexistent/outputs")).await;
        assert!(found.is_empty());
    }
}
