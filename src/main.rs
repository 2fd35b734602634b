//! dfs - four-node replicated file store
//!
//! `dfs node` runs one storage node; `dfs client` opens an interactive
//! session against the cluster.

mod console;

use dfs_core::{run_node, Invocation};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let invocation = Invocation::from_cli()?;

    // Initialize logging
    init_logging(invocation.log_level());

    match invocation {
        Invocation::Node(config) => {
            tracing::info!("Starting DFS node...");
            run_node(config).await?;
        }
        Invocation::Client(config) => {
            console::run_client(config).await?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    // stdout belongs to the operator console
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
