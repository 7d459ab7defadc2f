use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use fibernet_api::app::{self, services::AppServices};
use fibernet_api::cli::{self, Cli, Command};
use fibernet_api::scheduler;
use fibernet_infra::config::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fibernet_observability::init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let services = Arc::new(app::services::build_services(config).await?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(services).await,
        Command::QueueDailySync(args) => {
            let report = cli::queue_daily_sync(&services, &args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(services: Arc<AppServices>) -> anyhow::Result<()> {
    let jwt_secret = services.config.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });

    let executor = services.executor(&services.config.queue).spawn();
    let mut cron = scheduler::start(services.clone()).await?;

    let app = app::build_app(services.clone(), &jwt_secret);
    let listener = tokio::net::TcpListener::bind(&services.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", services.config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    if let Some(cron) = cron.as_mut() {
        cron.shutdown().await?;
    }
    executor.shutdown().await;
    Ok(())
}
