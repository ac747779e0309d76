//! Proxy binary

use beanproxy::{Proxy, ProxyConfig, ProxyServer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "beanproxy")]
#[command(about = "Replicating key-value proxy speaking the memcache protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Serve {
        /// Directory holding proxy.toml and route.toml
        #[arg(long, default_value = "./conf")]
        confdir: PathBuf,

        /// Override the memcache port
        #[arg(long)]
        port: Option<u16>,

        /// Override the web port
        #[arg(long)]
        webport: Option<u16>,

        /// Override the worker thread count
        #[arg(long)]
        threads: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            confdir,
            port,
            webport,
            threads,
        } => {
            let mut config = ProxyConfig::load(&confdir)?;
            // CLI flags win over the file
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if let Some(webport) = webport {
                config.proxy.webport = webport;
            }
            if let Some(threads) = threads {
                config.proxy.threads = threads;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.proxy.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.proxy.threads.max(1))
                .enable_all()
                .build()?;

            runtime.block_on(async move {
                let route = config.load_route()?;
                let proxy = Proxy::build(config, &route)?;
                ProxyServer::new(proxy).serve().await?;
                Ok::<(), anyhow::Error>(())
            })
        }
    }
}
