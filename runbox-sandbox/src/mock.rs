//! Scriptable mock runner for tests

use std::sync::Mutex;

use async_trait::async_trait;

use runbox_core::Result;

use crate::runner::{EventSink, SandboxEvent, SandboxRunner};
use crate::spec::{RunSpec, SandboxResult};

type Script = dyn Fn(&RunSpec) -> Result<SandboxResult> + Send + Sync;

/// Test double honoring the [`SandboxRunner`] contract. The script decides
/// the result per spec (and may write into the spec's workdir to emulate
/// user code producing artifacts); every received spec is recorded.
pub struct MockRunner {
    script: Box<Script>,
    specs: Mutex<Vec<RunSpec>>,
}

impl MockRunner {
    pub fn new(script: impl Fn(&RunSpec) -> Result<SandboxResult> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// A runner whose every run exits cleanly with the given stdout.
    pub fn succeeding(stdout: &'static str) -> Self {
        Self::new(move |_| Ok(SandboxResult::success(stdout.as_bytes().to_vec())))
    }

    /// Specs received so far, in order.
    pub fn received(&self) -> Vec<RunSpec> {
        self.specs.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl SandboxRunner for MockRunner {
    async fn run(&self, spec: &RunSpec, sink: Option<EventSink>) -> Result<SandboxResult> {
        self.specs
            .lock()
            .expect("mock lock poisoned")
            .push(spec.clone());
        let result = (self.script)(spec)?;
        if let Some(sink) = sink {
            if !result.stdout.is_empty() {
                let _ = sink.send(SandboxEvent::Stdout(result.stdout.clone()));
            }
            if !result.stderr.is_empty() {
                let _ = sink.send(SandboxEvent::Stderr(result.stderr.clone()));
            }
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
