use anyhow::Result;
use clap::Parser;
use live_events::{
    aggregator::LiveEventsAggregator,
    cli::Args,
    config::Config,
    events::create_event_channel,
    formatter::OutputFormat,
    monitoring::setup_metrics,
    tracing_setup::setup_tracing,
    transport::HttpLiveEventsApi,
    ui::{UIController, UIOptions, run_controls, spawn_stdin_reader},
};
use std::sync::Arc;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup tracing/logging
    setup_tracing(&args.log_level, args.json_logs)?;

    info!(
        "Starting live events client v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_args(&args)?;

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    if config.stream.tenant.is_none() {
        warn!("No team id and token configured, the live stream will not connect");
    }

    let api = Arc::new(HttpLiveEventsApi::new(
        config.stream.host.clone(),
        config.stream.connect_timeout,
        config.stats.request_timeout,
    )?);

    let (event_sender, event_receiver) = create_event_channel();
    let (aggregator, handle) = LiveEventsAggregator::new(&config, api, event_sender);
    let aggregator_task = tokio::spawn(aggregator.run());

    if config.output.controls {
        let controls = handle.clone();
        let colored = config.output.colored;
        tokio::spawn(run_controls(spawn_stdin_reader(), controls, colored));
    }

    let mut ui = UIController::new(
        event_receiver,
        handle.clone(),
        OutputFormat::from(config.output.format.as_str()),
        UIOptions {
            colored: config.output.colored,
            quiet: config.output.quiet,
            max_printed: config.output.max_printed,
        },
    );

    tokio::select! {
        _ = ui.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    // already stopped when the UI exited on a quit command
    let _ = handle.shutdown().await;

    if let Err(e) = aggregator_task.await? {
        error!("Aggregator error: {}", e);
        return Err(e.into());
    }

    info!("Client stopped successfully");
    Ok(())
}
