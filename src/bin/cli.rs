//! One-shot client for a ringkv cluster

use clap::{Parser, Subcommand};
use ringkv::common::{parse_duration, Config};
use ringkv::protocol::StatusType;
use ringkv::KvClient;

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "ringkv partitioned key-value store CLI")]
#[command(version)]
struct Cli {
    /// Any node of the cluster (host:port)
    #[arg(long, default_value = "127.0.0.1:50000")]
    server: String,

    /// Request timeout, e.g. "500ms", "30s"
    #[arg(long)]
    timeout: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Read a value
    Get {
        /// Key
        key: String,
    },

    /// Delete a key
    Delete {
        /// Key
        key: String,
    },

    /// Print the ring as seen by the server
    Metadata,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Config::load().client;
    if let Some(timeout) = &cli.timeout {
        settings.request_timeout_ms =
            u64::try_from(parse_duration(timeout)?.as_millis()).unwrap_or(u64::MAX);
    }

    let client = KvClient::new(cli.server.clone(), settings);
    let outcome = run(&client, cli.command).await;
    client.disconnect().await;
    outcome
}

async fn run(client: &KvClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put { key, value } => {
            let reply = client.put(&key, &value).await?;
            match reply.status {
                StatusType::PutSuccess => println!("Stored {}", key),
                StatusType::PutUpdate => println!("Updated {}", key),
                _ => anyhow::bail!("put failed: {}", reply),
            }
        }

        Commands::Get { key } => {
            let reply = client.get(&key).await?;
            match (reply.status, reply.value.as_deref()) {
                (StatusType::GetSuccess, Some(value)) => println!("{}", value),
                (StatusType::GetError, _) => anyhow::bail!("key not found: {}", key),
                _ => anyhow::bail!("get failed: {}", reply),
            }
        }

        Commands::Delete { key } => {
            let reply = client.delete(&key).await?;
            match reply.status {
                StatusType::DeleteSuccess => println!("Deleted {}", key),
                StatusType::DeleteError => anyhow::bail!("key not found: {}", key),
                _ => anyhow::bail!("delete failed: {}", reply),
            }
        }

        Commands::Metadata => {
            let metadata = client.refresh_metadata().await?;
            println!("{}", serde_json::to_string_pretty(metadata.nodes())?);
        }
    }

    Ok(())
}
