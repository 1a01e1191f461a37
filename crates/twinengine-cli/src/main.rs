//! TwinEngine CLI
//!
//! Thin wrapper around twinengine-core for inspecting and simulating device
//! twin reconciliation from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Show the effective engine configuration (TWINENGINE_* env applied)
//! twinengine config
//!
//! # Build the acknowledgement envelope for a property change
//! twinengine ack --property temp --value 21 --version 5
//!
//! # Same, but as the failure envelope
//! twinengine ack --property temp --value 21 --version 5 --fail
//!
//! # Normalize a twin component tree (file or stdin)
//! twinengine normalize tree.json
//!
//! # Run a desired-property delta through a full engine over the mock
//! # transport and print the reported ack patches
//! twinengine simulate \
//!     --component thermostat=target,mode \
//!     --version 3 \
//!     --delta '{"thermostat": {"target": 20}}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use twinengine_core::transport::mock::MockTransport;
use twinengine_core::{
    build_ack, normalize, EngineConfig, StaticIdentity, TwinEngine, TwinVersion,
};

/// TwinEngine - device twin reconciliation tooling
#[derive(Parser)]
#[command(name = "twinengine")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and simulate device twin reconciliation")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective engine configuration
    Config,

    /// Build the acknowledgement envelope for a writable-property change
    Ack {
        /// Property name
        #[arg(long)]
        property: String,

        /// New value, as JSON
        #[arg(long)]
        value: String,

        /// Desired-tree version the change was observed under
        #[arg(long)]
        version: TwinVersion,

        /// Build the failure envelope instead of the success one
        #[arg(long)]
        fail: bool,
    },

    /// Normalize a twin component tree (strip metadata, unwrap acks)
    Normalize {
        /// JSON file to read; stdin when omitted
        file: Option<PathBuf>,
    },

    /// Run a desired-property delta through an engine over the mock transport
    Simulate {
        /// Component declaration, repeatable: key=prop1,prop2
        #[arg(long = "component", required = true)]
        components: Vec<String>,

        /// Desired-tree version of the notification
        #[arg(long)]
        version: TwinVersion,

        /// Delta JSON, keyed by component
        #[arg(long)]
        delta: String,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Config => cmd_config(),
        Commands::Ack {
            property,
            value,
            version,
            fail,
        } => cmd_ack(&property, &value, version, fail),
        Commands::Normalize { file } => cmd_normalize(file),
        Commands::Simulate {
            components,
            version,
            delta,
        } => cmd_simulate(components, version, &delta).await,
    }
}

fn cmd_config() -> Result<()> {
    let config = EngineConfig::from_env()?;
    println!("Connect attempts: {}", config.connect_attempts);
    println!("Type header:      {}", config.type_header);
    println!("Reconnect:        {:?}", config.reconnect);
    Ok(())
}

fn cmd_ack(property: &str, value: &str, version: TwinVersion, fail: bool) -> Result<()> {
    let value: Value = serde_json::from_str(value)
        .with_context(|| format!("--value is not valid JSON: {value}"))?;
    let ack = build_ack(property, &value, version, None, !fail);
    println!("{}", serde_json::to_string_pretty(&ack.to_value())?);
    Ok(())
}

fn cmd_normalize(file: Option<PathBuf>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("reading stdin")?,
    };
    let tree: Value = serde_json::from_str(&raw).context("input is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&normalize(&tree))?);
    Ok(())
}

/// Parse a `key=prop1,prop2` component declaration
fn parse_component(decl: &str) -> Result<(String, Vec<String>)> {
    let (key, props) = match decl.split_once('=') {
        Some((key, props)) => (key, props),
        None => (decl, ""),
    };
    if key.is_empty() {
        bail!("component declaration has no key: {decl}");
    }
    let writable = props
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    Ok((key.to_string(), writable))
}

async fn cmd_simulate(components: Vec<String>, version: TwinVersion, delta: &str) -> Result<()> {
    let delta: Value = serde_json::from_str(delta).context("--delta is not valid JSON")?;

    let transport = Arc::new(MockTransport::new());
    let engine = TwinEngine::builder(
        transport.clone(),
        Arc::new(StaticIdentity::new("simulated-cert", "simulated-key")),
    )
    .config(EngineConfig::from_env()?)
    .build();

    let mut expected_acks = 0usize;
    for decl in &components {
        let (key, writable) = parse_component(decl)?;
        if let Some(component_delta) = delta.get(&key) {
            expected_acks += writable
                .iter()
                .filter(|p| component_delta.get(p.as_str()).is_some())
                .count();
        }
        engine.register_component(key, writable)?;
    }

    engine.connect().await?;
    transport.inject_desired_change(version, delta);

    // The engine reports acks from its background loop; poll briefly
    for _ in 0..100 {
        if transport.reported_patches().len() >= expected_acks {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.disconnect().await?;

    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let patches = transport.reported_patches();
    println!("{now}  version {version}: {} ack patch(es)", patches.len());
    for patch in patches {
        println!("{}", serde_json::to_string_pretty(&patch)?);
    }
    Ok(())
}
