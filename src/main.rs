//! Demo service with zero-downtime restarts.
//!
//! `kill -HUP <pid>` hands the listener to a fresh copy of this binary;
//! `kill -TERM <pid>` drains and exits.

use std::path::PathBuf;

use axum::routing::get;
use axum::Json;
use clap::Parser;
use serde_json::{json, Value};

use handoff::config::{load_config, EngineConfig, Strategy};
use handoff::lifecycle::ProcessIdentity;
use handoff::observability::{logging, metrics};
use handoff::Engine;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(about = "HTTP service with graceful reload and upgrade", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the upgrade strategy (graceful | broker).
    #[arg(short, long)]
    strategy: Option<Strategy>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(strategy) = cli.strategy {
        config.upgrade.strategy = strategy;
    }

    logging::install(logging::build_dispatch(&config.logging)?)?;

    let identity = ProcessIdentity::current();
    tracing::info!(
        pid = identity.pid,
        ppid = identity.parent_pid,
        address = %config.listen_address(),
        strategy = ?config.upgrade.strategy,
        readiness = ?config.upgrade.readiness,
        "handoff v0.1.0 starting"
    );

    if config.metrics.enabled {
        metrics::init_metrics(config.metrics.address.parse()?)?;
    }

    let strategy = config.upgrade.strategy;
    let engine = Engine::new(config).route("/", get(move || hello(identity)));
    engine.register_on_shutdown(move || {
        tracing::info!(pid = identity.pid, "Releasing application resources");
    });

    match strategy {
        Strategy::Graceful => {
            let transition = engine.graceful_run().await?;
            tracing::info!(?transition, "Exiting");
        }
        Strategy::Broker => engine.run().await?,
    }
    Ok(())
}

async fn hello(identity: ProcessIdentity) -> Json<Value> {
    Json(json!({
        "pid": identity.pid,
        "ppid": identity.parent_pid,
    }))
}
