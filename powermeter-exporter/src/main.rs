//! Prometheus exporter for Modbus power meters.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use powermeter_common::init_tracing;
use powermeter_exporter::config::{self, ExporterConfig};
use powermeter_exporter::{HttpServer, ModbusTransport, Scanner, http, registry};

/// Prometheus exporter for Modbus power meters.
#[derive(Parser, Debug)]
#[command(name = "powermeter-exporter")]
#[command(about = "Export Modbus power meter readings as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "/etc/opt/powermeter.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (overrides config).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let path = config::locate(&args.config)?;
    let mut config = ExporterConfig::load_from_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging, &config.log_directives())?;

    info!(config = %path.display(), "Starting power meter exporter");

    let meters = registry::resolve(&config).context("Invalid meter configuration")?;
    for meter in &meters {
        info!(
            unit = meter.address,
            device_type = meter.device_type.name(),
            registers = meter.registers.len(),
            "Configured meter"
        );
    }

    let listen_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let transport = ModbusTransport::connect(&config.modbus)
        .await
        .context("Failed to open Modbus transport")?;

    let scanner = Arc::new(Scanner::new(transport, meters, config.server.prefix.clone()));

    let http_server = HttpServer::new(
        scanner.clone(),
        listen_addr,
        config.server.path.clone(),
        config.server.access_log,
    );
    let listener = http_server.bind().await?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.serve(listener, shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    http::shutdown(&shutdown_tx, http_task, &scanner, Duration::from_secs(10)).await;

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
