//! Storage node server binary

use clap::{Parser, Subcommand};
use ringkv::common::{CacheStrategy, Config, NodeEndpoint};
use ringkv::node::NodeServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-node")]
#[command(about = "ringkv storage node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a storage node
    Serve {
        /// Node name (unique in the cluster)
        #[arg(long)]
        name: Option<String>,

        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,

        /// Directory holding the shard files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Cache policy: LRU, FIFO, LFU or None
        #[arg(long)]
        cache_strategy: Option<String>,

        /// Cache capacity in entries
        #[arg(long)]
        cache_size: Option<usize>,

        /// Serve immediately as the only ring member
        #[arg(long)]
        standalone: bool,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Serve {
            name,
            bind,
            data_dir,
            cache_strategy,
            cache_size,
            standalone,
            log_level,
        } => {
            let level = log_level.unwrap_or_else(|| config.log_level.clone());
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| level.into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            // CLI flags win over the file and environment
            let mut node_config = config.node.clone();
            if let Some(name) = name {
                node_config.name = name;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind.parse()?;
            }
            if let Some(data_dir) = data_dir {
                node_config.data_dir = data_dir;
            }
            if let Some(strategy) = cache_strategy {
                node_config.cache_strategy = strategy.parse::<CacheStrategy>()?;
            }
            if let Some(size) = cache_size {
                node_config.cache_size = size;
            }

            let server = NodeServer::bind(node_config, config.client.clone()).await?;
            let state = server.state();

            if standalone {
                let addr = server.local_addr()?;
                let endpoint = NodeEndpoint::new(
                    state.name(),
                    addr.ip().to_string(),
                    addr.port(),
                    state.hasher(),
                );
                state.standalone(endpoint);
            }

            let signal_state = state.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_state.request_shutdown();
                }
            });

            server.serve().await?;
        }
    }

    Ok(())
}
