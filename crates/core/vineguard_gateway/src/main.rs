#![forbid(unsafe_code)]

use anyhow::Context;
use mqtt_link::CloudLink;
use spool::Spool;
use std::sync::Arc;
use tokio::signal::unix;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vineguard_gateway::clock::WallClock;
use vineguard_gateway::config::GatewayConfig;
use vineguard_gateway::gateway::Gateway;
use vineguard_gateway::health::HealthServer;
use vineguard_gateway::sources::SOURCE_CHANNEL_CAPACITY;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    init_logging(&config.log_level);
    info!(gateway_id = %config.gateway_id, "starting the VineGuard edge gateway");

    if let Some(parent) = config.queue_db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating the queue directory {parent}"))?;
    }
    let spool = Arc::new(
        Spool::open(&config.queue_db_path)
            .with_context(|| format!("opening the message spool at {}", config.queue_db_path))?,
    );

    // Commands flow from the MQTT network loop into the gateway task over
    // this channel; the callback itself never blocks.
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let link = Arc::new(
        CloudLink::new(&config.link_config(), move |command| {
            let _ = command_tx.send(command);
        })
        .context("configuring the MQTT link")?,
    );

    let (gateway, connection_rx) = Gateway::new(
        config.clone(),
        Arc::new(WallClock),
        spool.clone(),
        link.clone(),
    )
    .context("wiring the gateway core")?;

    let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
    let stop = CancellationToken::new();
    let gateway_task = tokio::spawn(gateway.clone().run(
        source_rx,
        command_rx,
        connection_rx,
        stop.clone(),
    ));

    link.start();
    gateway
        .start_sources(&source_tx)
        .await
        .context("starting the packet sources")?;
    drop(source_tx);
    let health = HealthServer::start(config.health_port, gateway.clone())
        .await
        .with_context(|| format!("binding the health endpoint on port {}", config.health_port))?;

    wait_for_shutdown_signal().await?;
    info!("shutting down");

    health.stop().await;
    gateway.stop_sources().await;
    link.stop().await;
    stop.cancel();
    let _ = gateway_task.await;

    drop(gateway);
    if let Ok(spool) = Arc::try_unwrap(spool) {
        spool.close();
    }

    info!("gateway stopped");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigint = unix::signal(unix::SignalKind::interrupt())
        .context("installing the SIGINT handler")?;
    let mut sigterm = unix::signal(unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
