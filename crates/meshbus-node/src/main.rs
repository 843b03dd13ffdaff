use std::path::PathBuf;

use clap::Parser;

use meshbus_node::config::DEFAULT_CONFIG_PATH;
use meshbus_node::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "meshbus-node", about = "meshbus message bus router")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match NodeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    meshbus_node::logging::init_from_env(&config.logging.level);

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("failed to build node: {e}");
            std::process::exit(1);
        }
    };
    let handle = node.shutdown_handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
        handle.shutdown();
    });

    if let Err(e) = node.start().await {
        tracing::error!("failed to start node: {e}");
        node.shutdown().await;
        std::process::exit(1);
    }

    node.run().await;
}
