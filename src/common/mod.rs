//! Common utilities and types shared across ringkv

pub mod config;
pub mod error;
pub mod hash;
pub mod ring;
pub mod utils;

pub use config::{CacheStrategy, ClientConfig, Config, EcsConfig, NodeConfig, PoolEntry};
pub use error::{Error, Result};
pub use hash::{DigestHasher, KeyHasher, RingPosition};
pub use ring::{Metadata, NodeEndpoint};
pub use utils::{parse_duration, retry_with_backoff, validate_key, validate_value};
