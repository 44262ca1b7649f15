//! Runbox gateway server binary

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use runbox_sandbox::ContainerRunner;
use runbox_server::routes::{router, AppState};
use runbox_server::{Config, Orchestrator};
use runbox_storage::{ArtifactStore, RunStore, UrlSigner};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Runbox gateway...");

    let config = Config::from_env()?;
    info!(
        keys = config.api_keys.len(),
        work_root = %config.work_root.display(),
        storage_root = %config.storage_root.display(),
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.work_root)
        .await
        .context("failed to create work root")?;

    let signer = UrlSigner::new(
        config.signing_key.clone(),
        config.public_base_url.clone(),
        config.url_ttl_secs,
    );
    let store = Arc::new(
        ArtifactStore::open(config.storage_root.clone(), signer)
            .await
            .context("failed to open artifact store")?,
    );
    let runs = Arc::new(RunStore::new());
    let runner = Arc::new(ContainerRunner::new(config.container.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        runner,
        Arc::clone(&store),
        Arc::clone(&runs),
        config.limits.clone(),
        config.work_root.clone(),
    ));

    let tenants: HashMap<_, _> = config.tenants();
    let state = AppState {
        orchestrator,
        store,
        runs,
        hub: Arc::new(runbox_server::stream::StreamHub::new()),
        limiter: Arc::new(runbox_server::ratelimit::RateLimiter::new()),
        tenants: Arc::new(tenants),
        public_base_url: config.public_base_url.clone(),
    };

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    Ok(())
}
