//! External configuration service (ECS) binary

use clap::{Parser, Subcommand};
use ringkv::common::{CacheStrategy, Config, DigestHasher};
use ringkv::coordinator::{Controller, HealthChecker, MemoryRegistry, Registry, ScriptLauncher};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-ecs")]
#[command(about = "ringkv external configuration service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch nodes from the configured pool and keep the ring healthy
    Serve {
        /// Number of nodes to launch initially
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Cache policy for launched nodes: LRU, FIFO, LFU or None
        #[arg(long, default_value = "FIFO")]
        cache_strategy: String,

        /// Cache capacity of launched nodes
        #[arg(long, default_value = "100")]
        cache_size: usize,

        /// Launcher program, overrides the configured one
        #[arg(long)]
        launcher: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            nodes,
            cache_strategy,
            cache_size,
            launcher,
        } => {
            let strategy: CacheStrategy = cache_strategy.parse()?;
            let mut ecs_config = config.ecs.clone();
            if let Some(program) = launcher {
                ecs_config.launcher_program = program;
            }
            if ecs_config.pool.is_empty() {
                anyhow::bail!("no node pool configured; add [[ecs.pool]] entries to ringkv.toml");
            }

            tracing::info!("Starting ECS");
            tracing::info!("  Pool: {} nodes", ecs_config.pool.len());
            tracing::info!("  Launcher: {}", ecs_config.launcher_program);

            let hasher = DigestHasher::new(config.node.hash_prefix_bytes);
            let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
            let launcher = ScriptLauncher::new(
                ecs_config.launcher_program.clone(),
                ecs_config.launcher_args.clone(),
            );
            let health_interval = ecs_config.health_interval();
            let controller = Arc::new(Controller::new(
                ecs_config,
                config.client.clone(),
                &hasher,
                launcher,
                registry.clone(),
            ));

            let launched = controller
                .init_service(nodes, strategy, cache_size)
                .await?;
            controller.start().await?;
            tracing::info!("✓ ECS ready with {} nodes", launched.len());

            let membership = controller.clone().watch_membership();
            let health = HealthChecker::new(
                controller.admin().clone(),
                registry,
                health_interval,
            )
            .spawn(controller.clone());

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down service");

            health.abort();
            membership.abort();
            controller.shutdown().await?;
        }
    }

    Ok(())
}
