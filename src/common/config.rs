//! Configuration for ringkv components
//!
//! Values are layered: built-in defaults, then `ringkv.toml` (optional), then
//! `RINGKV_*` environment variables (`RINGKV_NODE__CACHE_SIZE=500`). The binaries
//! apply their command-line flags on top.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage node config
    pub node: NodeConfig,

    /// Client connection config
    pub client: ClientConfig,

    /// External configuration service (ECS) config
    pub ecs: EcsConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            client: ClientConfig::default(),
            ecs: EcsConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `ringkv.toml` and `RINGKV_*` overrides, falling back to defaults.
    pub fn load() -> Self {
        match Self::load_from("ringkv") {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load from a named file (extension optional) plus the environment.
    pub fn load_from(name: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("RINGKV").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.node.validate()?;
        if config.client.hash_prefix_bytes != config.node.hash_prefix_bytes {
            return Err(crate::Error::InvalidConfig(
                "client.hash_prefix_bytes must match node.hash_prefix_bytes".into(),
            ));
        }
        Ok(config)
    }
}

/// Cache eviction policy in front of the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStrategy {
    Lru,
    Fifo,
    Lfu,
    #[serde(alias = "None", alias = "none")]
    None,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Lru => write!(f, "LRU"),
            CacheStrategy::Fifo => write!(f, "FIFO"),
            CacheStrategy::Lfu => write!(f, "LFU"),
            CacheStrategy::None => write!(f, "None"),
        }
    }
}

impl std::str::FromStr for CacheStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(CacheStrategy::Lru),
            "FIFO" => Ok(CacheStrategy::Fifo),
            "LFU" => Ok(CacheStrategy::Lfu),
            "NONE" => Ok(CacheStrategy::None),
            _ => Err(crate::Error::InvalidConfig(format!(
                "unknown cache strategy: {}",
                s
            ))),
        }
    }
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (unique in the cluster)
    pub name: String,

    /// Address the node listens on
    pub bind_addr: SocketAddr,

    /// Directory holding the shard files
    pub data_dir: PathBuf,

    /// Cache policy
    pub cache_strategy: CacheStrategy,

    /// Cache capacity (entries)
    pub cache_size: usize,

    /// Hex characters of the key position that select a shard file
    pub shard_prefix_len: usize,

    /// Digest bytes kept for ring positions
    pub hash_prefix_bytes: usize,

    /// Number of successors holding a replica of each range
    pub replication_factor: usize,

    /// Interval between incremental replication rounds
    pub replication_interval_ms: u64,

    /// Maximum key length in bytes
    pub max_key_len: usize,

    /// Maximum value length in bytes
    pub max_value_len: usize,
}

pub const DEFAULT_MAX_KEY_LEN: usize = 20;
pub const DEFAULT_MAX_VALUE_LEN: usize = 120 * 1024;

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 50000)),
            data_dir: PathBuf::from("./ringkv-data"),
            cache_strategy: CacheStrategy::Fifo,
            cache_size: 100,
            shard_prefix_len: 2,
            hash_prefix_bytes: 16,
            replication_factor: 2,
            replication_interval_ms: 5_000,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

impl NodeConfig {
    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.shard_prefix_len == 0 || self.shard_prefix_len > 8 {
            return Err(crate::Error::InvalidConfig(
                "shard_prefix_len must be between 1 and 8".into(),
            ));
        }
        if self.shard_prefix_len > self.hash_prefix_bytes * 2 {
            return Err(crate::Error::InvalidConfig(
                "shard_prefix_len exceeds the ring position length".into(),
            ));
        }
        if self.hash_prefix_bytes == 0 || self.hash_prefix_bytes > 32 {
            return Err(crate::Error::InvalidConfig(
                "hash_prefix_bytes must be between 1 and 32".into(),
            ));
        }
        if self.replication_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "replication_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Client connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a caller waits for a correlated response
    pub request_timeout_ms: u64,

    /// How long `connect` waits for CONNECTION_ESTABLISHED
    pub connect_timeout_ms: u64,

    /// Bound of the response queue filled by the watcher
    pub queue_capacity: usize,

    /// Attempts per routed operation (reroutes, backoff, reconnects)
    pub max_attempts: usize,

    /// Initial backoff between attempts
    pub retry_delay_ms: u64,

    /// Key limit enforced before sending
    pub max_key_len: usize,

    /// Value limit enforced before sending
    pub max_value_len: usize,

    /// Ring position length used to route keys; must match the nodes'
    pub hash_prefix_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            queue_capacity: 64,
            max_attempts: 5,
            retry_delay_ms: 100,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            hash_prefix_bytes: 16,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One launchable node slot known to the ECS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// External configuration service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// Node slots the ECS may launch
    pub pool: Vec<PoolEntry>,

    /// Launcher program (receives the launch arguments)
    pub launcher_program: String,

    /// Extra arguments passed before the launch arguments
    pub launcher_args: Vec<String>,

    /// Registry address handed to launched nodes
    pub registry_addr: String,

    /// Interval between health checks
    pub health_interval_ms: u64,

    /// How long a launched node may take to accept connections
    pub launch_wait_ms: u64,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            pool: Vec::new(),
            launcher_program: "./scripts/launch-node.sh".to_string(),
            launcher_args: Vec::new(),
            registry_addr: "127.0.0.1:2181".to_string(),
            health_interval_ms: 2_000,
            launch_wait_ms: 10_000,
        }
    }
}

impl EcsConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn launch_wait(&self) -> Duration {
        Duration::from_millis(self.launch_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_strategy_parse() {
        assert_eq!("lru".parse::<CacheStrategy>().unwrap(), CacheStrategy::Lru);
        assert_eq!("FIFO".parse::<CacheStrategy>().unwrap(), CacheStrategy::Fifo);
        assert_eq!("Lfu".parse::<CacheStrategy>().unwrap(), CacheStrategy::Lfu);
        assert_eq!("none".parse::<CacheStrategy>().unwrap(), CacheStrategy::None);
        assert!("random".parse::<CacheStrategy>().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.node.validate().is_ok());
        assert_eq!(config.client.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.node.max_key_len, 20);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[node]
name = "node-7"
cache_strategy = "LRU"
cache_size = 12

[[ecs.pool]]
name = "a"
host = "127.0.0.1"
port = 50001
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.name, "node-7");
        assert_eq!(config.node.cache_strategy, CacheStrategy::Lru);
        assert_eq!(config.node.cache_size, 12);
        assert_eq!(config.node.shard_prefix_len, 2);
        assert_eq!(config.ecs.pool.len(), 1);
        assert_eq!(config.ecs.pool[0].port, 50001);
    }

    #[test]
    fn test_hash_prefix_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.toml");
        std::fs::write(&path, "[node]\nhash_prefix_bytes = 8\n").unwrap();
        assert!(Config::load_from(path.to_str().unwrap()).is_err());

        std::fs::write(
            &path,
            "[node]\nhash_prefix_bytes = 8\n\n[client]\nhash_prefix_bytes = 8\n",
        )
        .unwrap();
        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.client.hash_prefix_bytes, 8);
    }

    #[test]
    fn test_invalid_shard_prefix() {
        let node = NodeConfig {
            shard_prefix_len: 0,
            ..Default::default()
        };
        assert!(node.validate().is_err());
    }
}
