//! Storage node binary

use anyhow::Result;
use beanproxy::common::{NodeConfig, ProtocolConfig};
use beanproxy::NodeServer;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "beanproxy-node")]
#[command(about = "In-memory storage node for beanproxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a storage node
    Serve {
        /// Memcache listener
        #[arg(long, default_value = "0.0.0.0:7980")]
        bind: String,

        /// REST listener
        #[arg(long)]
        web: Option<String>,

        /// Largest accepted value in bytes
        #[arg(long)]
        body_max: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            web,
            body_max,
        } => {
            let mut mc = ProtocolConfig::default();
            if let Some(body_max) = body_max {
                mc.body_max = body_max;
            }
            NodeServer::new(NodeConfig { bind, web, mc }).serve().await?;
        }
    }

    Ok(())
}
