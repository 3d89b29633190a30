use anyhow::Context;
use clap::Parser;
use render_tiers::cli::{load_config, setup_logging, validate_config_file, Cli, CliRunner, Commands};
use render_tiers::{install_prometheus_exporter, Metrics, MetricsCollector};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("Starting render-tiers v{}", env!("CARGO_PKG_VERSION"));

    // Validation must not spin up any tier.
    if matches!(args.command, Commands::Validate) {
        let path = args.config.as_deref().context("validate needs --config <file>")?;
        return validate_config_file(path).await;
    }

    let config = load_config(&args).await?;

    // The recorder has to exist before metric handles are registered.
    if let Some(port) = args.metrics_port {
        install_prometheus_exporter(port)?;
        info!("Serving Prometheus metrics on port {}", port);
    }
    let metrics = Arc::new(Metrics::new());

    let runner = CliRunner::new(config, metrics.clone()).await?;
    let collector = MetricsCollector::new(metrics, runner.orchestrator.pressure().clone());
    let collection = collector.start_collection();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let cancel = runner.cancel.clone();
    let run = runner.run(args.command);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        Ok(()) = shutdown_rx.recv() => {
            info!("Received shutdown signal, cancelling in-flight conversions");
            cancel.cancel();
            // Let the command observe cancellation and release what it holds.
            run.await
        }
    };

    info!("Shutting down...");
    collection.abort();
    runner.orchestrator.shutdown().await;
    info!("Uptime: {:?}", collector.get_uptime());

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("render-tiers stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
