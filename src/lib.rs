//! # ringkv
//!
//! A partitioned, replicated key-value store with:
//! - Consistent-hash partitioning; nodes own contiguous ring ranges
//! - Shard-file storage with per-shard lock striping
//! - LRU / FIFO / LFU caches in front of storage
//! - A length-prefixed binary protocol with correlated responses
//! - Delta replication to successor nodes
//! - An external configuration service (ECS) that launches and rebalances nodes
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 ECS                     │
//! │  launches nodes, computes metadata,     │
//! │  moves ranges, watches the registry     │
//! └───────────┬─────────────────────────────┘
//!             │ admin commands
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Node 1     │──▶│ Node 2     │──▶│ Node 3       │
//! │ (a, b]     │   │ (b, c]     │   │ (c, a]       │
//! │ cache+disk │   │ cache+disk │   │ cache+disk   │
//! └────────────┘   └────────────┘   └──────────────┘
//!        ▲  replicas flow to successors
//!        │
//!     clients route by metadata, follow NOT_RESPONSIBLE
//! ```
//!
//! ## Usage
//!
//! ### Start a node on its own
//! ```bash
//! ringkv-node serve --name node-1 --bind 127.0.0.1:50000 \
//!   --data-dir ./node-1 --cache-strategy LRU --cache-size 100 --standalone
//! ```
//!
//! ### Start the ECS with a pool from `ringkv.toml`
//! ```bash
//! ringkv-ecs serve --nodes 3 --cache-strategy FIFO --cache-size 100
//! ```
//!
//! ### Use the CLI
//! ```bash
//! ringkv put my-key my-value --server 127.0.0.1:50000
//! ringkv get my-key
//! ringkv delete my-key
//! ringkv metadata
//! ```

pub mod client;
pub mod common;
pub mod coordinator;
pub mod node;
pub mod protocol;

// Re-export commonly used types
pub use client::{Connection, KvClient};
pub use common::{Config, Error, Result};
pub use coordinator::Controller;
pub use node::NodeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
