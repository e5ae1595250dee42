//! Foreman runtime manager daemon.

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use foreman_manager::{Config, Manager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting foreman runtime manager");

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        run_root = %config.run_root.display(),
        "configuration loaded"
    );

    let manager = Manager::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    manager.run(shutdown_rx).await?;
    info!("runtime manager stopped");
    Ok(())
}
