//! Certfleet management hub server
//!
//! This binary runs the central hub that certificate instances attach to over
//! the WebSocket push channel, together with the management REST API and the
//! background worker that keeps the managed-items cache fresh.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use certfleet_api::{ApiServer, ApiServerConfig, ManagementApi};
use certfleet_hub::{ManagementHub, ManagementWorker};
use certfleet_proto::HUB_PATH;
use certfleet_registry::{CommandWaiters, InstanceRegistry};

/// Certfleet hub - central management server for certificate instances
#[derive(Parser, Debug)]
#[command(name = "certfleet")]
#[command(about = "Run the certfleet management hub server")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Run the certfleet management hub.

Instances attach over the WebSocket push channel and are polled for their
managed items on a fixed interval. The REST API exposes the cached state
and forwards item-level commands to connected instances.

EXAMPLES:
  # Run with defaults (API + push channel on 0.0.0.0:8088)
  certfleet

  # Bind to a specific address and poll every 30 seconds
  certfleet --http-addr 127.0.0.1:9000 --poll-interval-secs 30

  # Push channel only, without the REST API and Swagger UI
  certfleet --no-api

ENVIRONMENT VARIABLES:
  CERTFLEET_HTTP_ADDR        HTTP bind address
  CERTFLEET_POLL_INTERVAL    Seconds between polling cycles
  CERTFLEET_COMMAND_TIMEOUT  Seconds to wait for command results
"#)]
struct Args {
    /// HTTP bind address for the API and the instance push channel
    #[arg(long, env = "CERTFLEET_HTTP_ADDR", default_value = "0.0.0.0:8088")]
    http_addr: String,

    /// Seconds between managed-item polling cycles
    #[arg(long, env = "CERTFLEET_POLL_INTERVAL", default_value = "60")]
    poll_interval_secs: u64,

    /// Seconds to wait for an instance to answer a dispatched command
    #[arg(long, env = "CERTFLEET_COMMAND_TIMEOUT", default_value = "20")]
    command_timeout_secs: u64,

    /// Disable the management REST API (the push channel stays enabled)
    #[arg(long)]
    no_api: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("🚀 Starting certfleet management hub");

    let bind_addr: SocketAddr = args.http_addr.parse()?;

    let hub = ManagementHub::new(InstanceRegistry::new(), CommandWaiters::new());
    info!("✅ Instance registry initialized");
    info!("Instances will be identified automatically when they attach");

    let worker = ManagementWorker::new(hub.clone())
        .with_poll_interval(Duration::from_secs(args.poll_interval_secs));
    let worker_handle = tokio::spawn(async move {
        worker.run().await;
    });
    info!(
        "✅ Management worker started (polls every {}s)",
        args.poll_interval_secs
    );

    let api = ManagementApi::new(hub.clone())
        .with_command_timeout(Duration::from_secs(args.command_timeout_secs));

    let config = ApiServerConfig {
        bind_addr,
        enable_cors: true,
        enable_management: !args.no_api,
    };

    let server = ApiServer::new(config, api, hub);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("API server error: {}", e);
        }
    });

    info!("✅ Certfleet management hub is running");
    info!("  - Instance push channel: ws://{}{}", args.http_addr, HUB_PATH);
    if !args.no_api {
        info!(
            "  - API/Swagger UI: {} (OpenAPI at /api/openapi.json)",
            args.http_addr
        );
    }
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping servers...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    server_handle.abort();
    worker_handle.abort();
    info!("✅ Certfleet management hub stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
