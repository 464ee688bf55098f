use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use voxrelay::App;
use voxrelay::config::AppConfig;
use voxrelay::logging::init_logging;
use voxrelay::model::ScriptedModelFactory;
use voxrelay::utils::http_client::install_rustls_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env_or_default();
    let (logging, _guard) = init_logging(&config.logging)?;
    install_rustls_provider();

    warn!("No inference backend is linked in; serving with the scripted model backend");
    let factory = Arc::new(ScriptedModelFactory::new());

    let app = App::build(config, factory)
        .await
        .context("failed to build voxrelay")?;
    let report = app.start().await.context("failed to start voxrelay")?;
    info!(
        addr = %app.local_addr(),
        resumed = report.resumed,
        redelivered = report.redelivered,
        "Ready"
    );
    logging.start_retention_cleanup(app.cancellation_token());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    app.shutdown().await;
    Ok(())
}
