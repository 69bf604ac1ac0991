use anyhow::Context;
use event_relay::RelayService;
use event_relay::config::RelayConfig;
use event_relay::logging::init_logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = RelayConfig::from_env().context("loading configuration")?;

    let (logging, _guard) = init_logging(&config.logging).context("initializing logging")?;
    info!(
        filter = %logging.get_filter(),
        log_dir = ?logging.log_dir(),
        "Logging initialized"
    );
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());
    #[cfg(unix)]
    logging
        .start_reload_on_hangup(shutdown.clone())
        .context("installing SIGHUP handler")?;

    let service = RelayService::from_config(config);
    let running = service.start().await?;
    info!(running, "event-relay initialized, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    service.stop().await?;
    shutdown.cancel();
    Ok(())
}
