//! Certfleet Agent - instance-side push channel client
//!
//! This binary attaches a certificate instance to a central management hub,
//! serving identity, inventory and item operations over the push channel.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use certfleet_agent::{AgentClient, LocalStoreService};
use certfleet_proto::ManagedItem;

/// Certfleet agent - connects a certificate instance to a management hub
#[derive(Parser, Debug)]
#[command(name = "certfleet-agent")]
#[command(about = "Certfleet agent - connects a certificate instance to a management hub")]
#[command(version)]
#[command(long_about = r#"
The Certfleet agent dials out to a management hub and answers the commands
the hub pushes down: identity, managed item inventory, item updates,
deletions, log tails and configuration tests.

EXAMPLES:
  # Attach to a hub with an explicit identity
  certfleet-agent --hub-url ws://hub.internal:8088 \
    --instance-id site-a --title "Front web server"

  # Attach using a config file
  certfleet-agent --config agent-config.yaml

  # Attach with debug logging
  certfleet-agent --hub-url ws://hub.internal:8088 --log-level debug

ENVIRONMENT VARIABLES:
  CERTFLEET_HUB_URL      Management hub URL (ws:// or wss://)
  CERTFLEET_INSTANCE_ID  Instance identifier
  CERTFLEET_TITLE        Human readable instance title
"#)]
struct Args {
    /// Management hub URL (e.g. ws://hub.internal:8088)
    #[arg(long, env = "CERTFLEET_HUB_URL")]
    hub_url: Option<String>,

    /// Instance ID (auto-generated if not specified)
    #[arg(long, env = "CERTFLEET_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Human readable title shown in the hub
    #[arg(long, env = "CERTFLEET_TITLE")]
    title: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// Hub connection settings
    hub: HubConfigFile,

    /// Instance identity and seeded items
    #[serde(default)]
    instance: InstanceConfigFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HubConfigFile {
    /// Management hub URL
    url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstanceConfigFile {
    /// Instance ID
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    /// Instance title
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,

    /// Managed items served by this agent
    #[serde(default)]
    items: Vec<ItemConfigFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemConfigFile {
    /// Item display name
    name: String,

    /// Domains covered by the certificate
    #[serde(default)]
    domains: Vec<String>,

    /// Renew automatically
    #[serde(default = "default_auto_renew")]
    auto_renew: bool,
}

fn default_auto_renew() -> bool {
    true
}

impl ItemConfigFile {
    fn into_item(self) -> ManagedItem {
        let mut item = ManagedItem::new(&self.name).with_domains(self.domains);
        item.auto_renew = self.auto_renew;
        item
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_setup(args: Args) -> Result<(String, LocalStoreService)> {
    let config_file = if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        load_config_file(config_path)?
    } else {
        ConfigFile::default()
    };

    let hub_url = args.hub_url.unwrap_or(config_file.hub.url);
    if hub_url.is_empty() {
        anyhow::bail!("Hub URL is required (use --hub-url or config file)");
    }

    let instance_id = args
        .instance_id
        .or(config_file.instance.id)
        .unwrap_or_else(|| {
            let id = format!("instance-{}", Uuid::new_v4());
            info!("Auto-generated instance ID: {}", id);
            id
        });

    let title = args
        .title
        .or(config_file.instance.title)
        .unwrap_or_else(|| instance_id.clone());

    let mut service = LocalStoreService::new(instance_id, title);
    for entry in config_file.instance.items {
        service = service.with_item(entry.into_item());
    }

    Ok((hub_url, service))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Certfleet Agent starting...");

    let (hub_url, service) = build_setup(args).context("Failed to build agent configuration")?;

    let client = AgentClient::new(&hub_url, Arc::new(service))
        .context("Failed to create push channel client")?;

    info!("Hub: {}", client.hub_url());

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let client_task = tokio::spawn(async move { client.run().await });

    // Wait for Ctrl+C or client error
    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = client_task => {
            match result {
                Ok(Ok(())) => {
                    info!("Agent stopped normally");
                }
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_parses_items() {
        let yaml = r#"
hub:
  url: ws://hub.internal:8088
instance:
  id: site-a
  title: Front web server
  items:
    - name: web-frontend
      domains: [example.com, www.example.com]
    - name: legacy
      domains: [old.example.com]
      auto_renew: false
"#;
        let config: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.hub.url, "ws://hub.internal:8088");
        assert_eq!(config.instance.id.as_deref(), Some("site-a"));
        assert_eq!(config.instance.items.len(), 2);

        let legacy = config.instance.items.into_iter().nth(1).unwrap().into_item();
        assert!(!legacy.auto_renew);
        assert_eq!(legacy.primary_domain(), Some("old.example.com"));
    }

    #[test]
    fn test_item_defaults_to_auto_renew() {
        let yaml = r#"
name: web
domains: [example.com]
"#;
        let entry: ItemConfigFile = serde_yaml::from_str(yaml).unwrap();
        let item = entry.into_item();
        assert!(item.auto_renew);
        assert_eq!(item.name, "web");
    }
}
