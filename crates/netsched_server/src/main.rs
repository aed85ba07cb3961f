//! NetSched server binary.
//!
//! Usage:
//!     netsched-server --bind 127.0.0.1:9100 --config netsched.toml

use anyhow::{Context, Result};
use clap::Parser;
use netsched_logging::{init_logging, LogConfig};
use netsched_protocol::{QueueParams, ServerParams};
use netsched_queue::NullJournal;
use netsched_server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "netsched-server", about = "NetSched job scheduling server")]
struct Args {
    /// TCP bind address for the command protocol
    #[arg(long)]
    bind: Option<String>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stable node identifier reported in job keys and notifications
    #[arg(long)]
    node_id: Option<String>,

    /// Mirror the full log stream to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = init_logging(LogConfig {
        app_name: "netsched-server",
        verbose: args.verbose,
    })?;

    let mut params = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<ServerParams>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => ServerParams::default(),
    };
    if let Some(bind) = args.bind {
        params.bind_addr = bind;
    }
    if let Some(node_id) = args.node_id {
        params.node_id = node_id;
    }
    // A server with no configured queues still answers; give it a default
    // queue so ad-hoc clients have somewhere to land.
    if params.queues.is_empty() {
        params.queues.insert("main".to_string(), QueueParams::default());
    }

    tracing::info!("Starting NetSched server");
    tracing::info!("  Bind: {}", params.bind_addr);
    tracing::info!("  Queues: {}", params.queues.len());

    let server = Server::bind(params, Arc::new(NullJournal))?;
    server.run()
}
