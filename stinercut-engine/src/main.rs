use std::sync::Arc;

use anyhow::Context;
use stinercut_engine::api::{ApiServer, AppState};
use stinercut_engine::config::EngineConfig;
use stinercut_engine::database::{self, repositories::SqlxExecutionRepository};
use stinercut_engine::logging;
use stinercut_engine::pipeline::{
    Orchestrator, ProgressNotifier, Scheduler, SqliteWorkQueue, StepRegistry, Sweeper, WorkerPool,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;

    let pool = database::connect(&config.database_url)
        .await
        .with_context(|| format!("cannot open database {}", config.database_url))?;

    let queue = Arc::new(SqliteWorkQueue::with_poll_interval(
        pool.clone(),
        config.poll_interval,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(SqlxExecutionRepository::new(pool.clone())),
        queue,
        ProgressNotifier::new(),
    ));
    let registry = Arc::new(StepRegistry::with_builtins());
    let orchestrator = Arc::new(Orchestrator::new(registry.clone(), scheduler.clone()));

    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    tracing::info!(
        workers = config.workers.workers,
        pipelines = ?registry.pipeline_types(),
        "stinercut-engine starting"
    );

    let workers = WorkerPool::new(config.workers.clone());
    workers.start(scheduler.clone(), registry);

    let sweeper = Arc::new(Sweeper::new(scheduler, config.sweeper.clone()));
    let sweeper_task = sweeper.start(shutdown.clone());

    let state = AppState::new(orchestrator).with_logging_config(logging_config);
    let server =
        ApiServer::new(config.api.clone(), state).with_cancel_token(shutdown.clone());
    let mut server_task = tokio::spawn(async move { server.run().await });

    let server_result = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
            shutdown.cancel();
            server_task.await
        }
        result = &mut server_task => result,
    };

    shutdown.cancel();
    workers.stop().await;
    let _ = sweeper_task.await;
    pool.close().await;

    match server_result {
        Ok(result) => result.context("API server failed")?,
        Err(e) => tracing::error!(error = %e, "API server task panicked"),
    }

    tracing::info!("stinercut-engine stopped");
    Ok(())
}
