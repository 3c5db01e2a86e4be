//! Storage node: shard files, cache, sessions and replication

pub mod cache;
pub mod delta;
pub mod replication;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

pub use cache::{build_cache, Cache, FifoCache, LfuCache, LruCache, NoCache};
pub use delta::StorageDelta;
pub use replication::{PushFailure, ReplicaSink, ReplicationEngine};
pub use server::{NodeServer, NodeState, ServingState};
pub use storage::{PutOutcome, ShardStore};
pub use store::KvStore;
