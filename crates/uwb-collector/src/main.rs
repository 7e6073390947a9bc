// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UWB Range Collector CLI
//!
//! Collects distance readings from MQTT until stopped, then writes one CSV
//! file per topic.
//!
//! # Usage
//!
//! ```bash
//! # Run with config/config.yaml
//! uwb-collector
//!
//! # Other broker, output to a directory
//! uwb-collector --broker 192.168.1.20 --port 1883 --output runs/today/
//!
//! # Check a configuration file without connecting
//! uwb-collector validate --config lab.yaml
//! ```
//!
//! Type `q` + Enter or press Ctrl+C to stop and export.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use uwb_collector::{
    Config, ControllerOptions, CsvExporter, LifecycleController, MqttTransport, OperatorConsole,
    RunReport,
};

/// UWB range collector
#[derive(Parser, Debug)]
#[command(name = "uwb-collector")]
#[command(about = "UWB Range Collector - MQTT distance readings to per-topic CSV")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Broker host (overrides mqtt.broker)
    #[arg(long)]
    broker: Option<String>,

    /// Broker port (overrides mqtt.port)
    #[arg(long)]
    port: Option<u16>,

    /// Topic prefix (overrides mqtt.topic)
    #[arg(long)]
    topic: Option<String>,

    /// Output file or directory (overrides data.data_processed)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(Commands::Validate { config }) = &args.command {
        return cmd_validate(config);
    }

    let config = build_config(&args)?;

    tracing::info!("UWB Range Collector v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    tracing::info!("  Topics: {}", config.mqtt.subscription_filter());
    tracing::info!("  Output: {}", config.data.data_processed.display());

    let console = OperatorConsole::stdin().context("Failed to start console reader")?;
    let controller = LifecycleController::new(ControllerOptions::from_config(&config));
    let transport = MqttTransport::new(config.mqtt.clone());

    let report = controller
        .run(transport, console, &CsvExporter::new(), interrupt())
        .await;
    print_summary(&report);

    Ok(())
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if let Some(broker) = &args.broker {
        config.mqtt.broker = broker.clone();
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    if let Some(topic) = &args.topic {
        config.mqtt.topic = topic.clone();
    }
    if let Some(output) = &args.output {
        config.data.data_processed = output.clone();
    }

    config.validate().context("Invalid command-line override")?;
    Ok(config)
}

fn cmd_validate(path: &Path) -> Result<()> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("Configuration OK: {}", path.display());
    println!("  Broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    println!("  Subscription: {}", config.mqtt.subscription_filter());
    println!("  Value field: {}", config.data.value_field);
    println!("  Output: {}", config.data.data_processed.display());
    Ok(())
}

/// Resolves on Ctrl+C. If the handler can't be installed it never resolves
/// and the other stop triggers still work.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn print_summary(report: &RunReport) {
    tracing::info!("Stopped by {}", report.trigger);
    if let Some(e) = &report.connection_error {
        tracing::error!("No session was established: {}", e);
    }

    let stats = &report.stats;
    tracing::info!(
        "Messages: {} received, {} recorded, {} undecodable, {} after stop",
        stats.messages_received,
        stats.samples_recorded,
        stats.decode_errors,
        stats.ignored_after_stop
    );

    let export = &report.export;
    tracing::info!(
        "Export: {} files written, {} failed, {} empty topics skipped",
        export.written.len(),
        export.failed.len(),
        export.skipped_empty.len()
    );
    for (topic, e) in &export.failed {
        tracing::error!("  {}: {}", topic, e);
    }
}
