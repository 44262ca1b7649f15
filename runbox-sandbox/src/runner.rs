//! The sandbox runner trait

use async_trait::async_trait;
use tokio::sync::mpsc;

use runbox_core::Result;

use crate::spec::{RunSpec, SandboxResult};

/// Incremental output observed while a sandbox is running. Forwarded to the
/// stream hub when the run was started with a sink.
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type EventSink = mpsc::UnboundedSender<SandboxEvent>;

/// Capability that turns a prepared run specification into a completed
/// sandbox result. Implementations must honor the full isolation and
/// status-mapping contract regardless of backing technology.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Execute the run to completion. When `sink` is present, stdout and
    /// stderr segments are forwarded as they arrive; the buffers in the
    /// returned result are authoritative either way.
    async fn run(&self, spec: &RunSpec, sink: Option<EventSink>) -> Result<SandboxResult>;

    /// Implementation name, for logs.
    fn name(&self) -> &str;
}
