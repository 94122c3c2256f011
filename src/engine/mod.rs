pub mod api;
pub mod compare;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod verdict;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::routes, config::EngineConfig, metrics::MetricsRegistry, orchestrator::Judge,
    queue::Scheduler, sandbox::SandboxFactory, store::MemoryStore, worker::spawn_worker_pool,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    init_tracing(&config);

    let store = MemoryStore::new(config.persistence_path.clone()).with_default_limits(
        config.judging.default_time_limit_secs,
        config.judging.default_memory_limit_mb,
    );
    if let Some(path) = &config.problems_path {
        let loaded = store.load_catalog(path).await?;
        tracing::info!(problems = loaded, path = %path.display(), "problem catalog loaded");
    } else {
        tracing::warn!("PROBLEMS_PATH not set, every submission will abort with an unknown problem");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(config.queue_capacity, metrics.clone());
    let sandbox = SandboxFactory::from_config(&config).context("sandbox backend init failed")?;
    tracing::info!(
        backend = sandbox.name(),
        compare_policy = ?config.judging.compare_policy,
        unknown_memory = ?config.judging.unknown_memory,
        case_concurrency = config.judging.case_concurrency,
        "sandbox backend selected"
    );

    let judge = Arc::new(Judge::new(
        Arc::new(store.clone()),
        sandbox,
        config.judging.clone(),
    ));
    spawn_worker_pool(config.worker_count, scheduler.receiver(), judge, metrics.clone());

    let app: Router = routes(store, scheduler, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, workers = config.worker_count, "judge engine ready");
    axum::serve(listener, app).await.context("judge server error")?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
