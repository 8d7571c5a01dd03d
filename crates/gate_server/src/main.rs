use anyhow::Context;
use gate_server::cli::CliArgs;
use gate_server::logging::setup_logging;
use gate_server::signals::wait_for_shutdown;
use gate_server::{AppConfig, Gate};
use module_runtime::App;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    if let Some(bind) = &args.bind_address {
        config.server.bind_address = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("validating configuration")?;

    setup_logging(&config.logging, args.json_logs).context("installing log subscriber")?;
    info!(bind = %config.server.bind_address, "🌟 Gate starting");

    let mut app = App::new(config.to_runtime_config());
    let gate = Gate::start(&mut app, &config).context("starting gate")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(gate.serve(shutdown_rx));

    match wait_for_shutdown().await {
        Ok(reason) => info!(%reason, "🛑 Shutting down"),
        Err(err) => error!("❌ Signal handling failed, shutting down: {}", err),
    }
    let _ = shutdown_tx.send(());
    if let Err(err) = server.await {
        error!("❌ Gate task ended abnormally: {}", err);
    }
    app.shutdown().await;
    info!("✅ Shutdown complete");
    Ok(())
}
