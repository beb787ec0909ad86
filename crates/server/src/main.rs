mod bootstrap;
mod health;
mod orchestrator;
mod queue;

use anyhow::Result;
use reservo_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use reservo_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    let (queue_sender, queue_receiver) = queue::channel(app.config.server.queue_capacity);
    let worker = queue::QueueWorker::new(app.orchestrator.clone());
    let worker_handle = tokio::spawn(worker.run(queue_receiver));

    tracing::info!(
        event_name = "system.server.started",
        queue_capacity = app.config.server.queue_capacity,
        "reservo-server started"
    );

    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "reservo-server stopping");

    // Dropping the sender closes the queue; the worker drains in-flight
    // items before exiting.
    drop(queue_sender);
    worker_handle.await?;
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
