use anyhow::Context;
use timetable_infra::AppConfig;
use timetable_infra::jobs::{WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    timetable_observability::init(config.log_format);

    let (services, orchestrator) = timetable_api::app::services::build_services(&config).await?;
    let pool = WorkerPool::spawn(
        orchestrator,
        WorkerPoolConfig::default()
            .with_workers(config.worker_count)
            .with_poll_interval(config.poll_interval),
    );
    let services = services.with_worker_stats(pool.stats_reader());
    let shutdown = services.shutdown_token();
    let app = timetable_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, workers = config.worker_count, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            // Ends open event streams so the server can drain.
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    pool.shutdown().await;
    tracing::info!("stopped");
    Ok(())
}
