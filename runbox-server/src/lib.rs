//! Runbox gateway service
//!
//! Composes the core, storage, and sandbox crates into the running service:
//! the orchestrator pipeline, per-tenant admission control, the streaming
//! hub, and the axum HTTP surface.

pub mod auth;
pub mod config;
pub mod orchestrator;
pub mod ratelimit;
pub mod routes;
pub mod stream;

pub use config::Config;
pub use orchestrator::Orchestrator;
pub use routes::{router, AppState};
