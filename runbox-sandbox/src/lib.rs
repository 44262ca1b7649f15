//! Sandbox runner capability for the Runbox gateway
//!
//! The orchestrator depends on a single operation: `run(spec) -> result`.
//! Two implementations share no code — [`ContainerRunner`] launches one
//! strictly isolated container per run; [`MockRunner`] backs the test suite
//! with scripted results under the identical contract.

mod container;
mod mock;
mod runner;
mod spec;

pub use container::{ContainerConfig, ContainerRunner};
pub use mock::MockRunner;
pub use runner::{EventSink, SandboxEvent, SandboxRunner};
pub use spec::{classify_exit, read_usage_file, BootstrapSpec, RunSpec, SandboxResult};
