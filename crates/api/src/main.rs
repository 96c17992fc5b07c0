use anyhow::Context;

use regsync_infra::config::{LogFormat, SyncConfig};
use regsync_observability::LogOutput;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = SyncConfig::from_env().context("loading configuration")?;

    regsync_observability::init(match config.log_format {
        LogFormat::Json => LogOutput::Json,
        LogFormat::Pretty => LogOutput::Pretty,
    });

    let (services, engine) = regsync_api::app::services::build_services(&config).await?;
    let workers = regsync_api::app::services::spawn_workers(engine, &config);
    let app = regsync_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    for worker in workers {
        let name = worker.name();
        worker.shutdown().await;
        tracing::debug!(worker = name, "worker joined");
    }
    Ok(())
}
