//! Storage node server
//!
//! Owns the shared `NodeState` (store, metadata, serving state, replication)
//! and the accept loop. Each accepted socket gets its own session task; a
//! background task runs a replication round every `replication_interval`.

use crate::client::Connection;
use crate::common::{
    ClientConfig, DigestHasher, KeyHasher, Metadata, NodeConfig, NodeEndpoint, Result,
    RingPosition,
};
use crate::node::replication::ReplicationEngine;
use crate::node::session;
use crate::node::store::KvStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock, RwLockReadGuard};

/// Whether the node answers client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Every client request gets SERVER_STOPPED
    Stopped,
    Serving,
    /// Reads are served, writes get SERVER_WRITE_LOCK
    WriteLocked,
}

impl std::fmt::Display for ServingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServingState::Stopped => write!(f, "stopped"),
            ServingState::Serving => write!(f, "serving"),
            ServingState::WriteLocked => write!(f, "write-locked"),
        }
    }
}

/// State shared by every session of a node
pub struct NodeState {
    config: NodeConfig,
    client: ClientConfig,
    hasher: Arc<dyn KeyHasher>,
    store: Arc<KvStore>,
    replication: Arc<ReplicationEngine>,
    serving: watch::Sender<ServingState>,
    /// Client writes hold a read guard; write-locking takes the write side
    write_gate: RwLock<()>,
    metadata: watch::Sender<Option<Arc<Metadata>>>,
    shutdown: watch::Sender<bool>,
}

impl NodeState {
    pub fn open(config: NodeConfig, client: ClientConfig) -> Result<Self> {
        config.validate()?;
        let hasher: Arc<dyn KeyHasher> = Arc::new(DigestHasher::new(config.hash_prefix_bytes));
        let store = Arc::new(KvStore::open(&config, hasher.clone())?);

        Ok(Self {
            config,
            client,
            hasher,
            store,
            replication: Arc::new(ReplicationEngine::new()),
            serving: watch::Sender::new(ServingState::Stopped),
            write_gate: RwLock::new(()),
            metadata: watch::Sender::new(None),
            shutdown: watch::Sender::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn hasher(&self) -> &dyn KeyHasher {
        self.hasher.as_ref()
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    pub fn serving(&self) -> ServingState {
        *self.serving.borrow()
    }

    pub fn set_serving(&self, state: ServingState) {
        let previous = self.serving.send_replace(state);
        if previous != state {
            tracing::info!("Node {}: {} -> {}", self.name(), previous, state);
        }
    }

    /// Held by a client write from its serving check until it is stored.
    pub async fn write_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    /// Enter `WriteLocked` once every client write in flight has finished.
    pub async fn lock_writes(&self) {
        let _drained = self.write_gate.write().await;
        self.set_serving(ServingState::WriteLocked);
    }

    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        self.metadata.borrow().clone()
    }

    /// Install a new ring snapshot; a changed own range restarts replication.
    pub fn update_metadata(&self, metadata: Metadata) {
        let name = self.name();
        let new_range = metadata.range_of(name);
        let old_range = self.metadata().and_then(|m| m.range_of(name));

        match &new_range {
            Some((start, end)) if old_range.as_ref() != Some(&(start.clone(), end.clone())) => {
                tracing::info!("Node {} now owns ({}, {}]", name, start, end);
                self.replication.reset_baseline(start.clone(), end.clone());
            }
            Some(_) => {}
            None => {
                tracing::info!("Node {} is not part of the ring", name);
                self.replication.clear();
            }
        }

        tracing::info!("Node {} installed metadata with {} nodes", name, metadata.len());
        self.metadata.send_replace(Some(Arc::new(metadata)));
    }

    /// Serve alone: the ring holds only this node.
    pub fn standalone(&self, endpoint: NodeEndpoint) {
        self.update_metadata(Metadata::new(vec![endpoint]));
        self.set_serving(ServingState::Serving);
    }

    /// Copy every record in `(start, end]` to `target`.
    pub async fn transfer(
        &self,
        target: &NodeEndpoint,
        start: &RingPosition,
        end: &RingPosition,
    ) -> Result<usize> {
        tracing::info!("Node {}: transferring ({}, {}] to {}", self.name(), start, end, target);
        let mut conn = Connection::connect(&target.address(), &self.client).await?;
        let result =
            ReplicationEngine::full_sync(&self.store, start, end, &target.name, &mut conn).await;
        conn.disconnect().await;
        let moved = result?;
        tracing::info!("Node {}: transferred {} records to {}", self.name(), moved, target.name);
        Ok(moved)
    }

    /// Drop local records in `(start, end]`.
    pub async fn remove_range(&self, start: &RingPosition, end: &RingPosition) -> Result<usize> {
        let store = self.store.clone();
        let (start, end) = (start.clone(), end.clone());
        let removed = tokio::task::spawn_blocking(move || store.remove_range(&start, &end)).await??;
        tracing::info!("Node {}: removed {} records", self.name(), removed);
        Ok(removed)
    }

    /// Push recorded writes to this node's replicas once.
    pub async fn replicate_once(&self) -> Result<usize> {
        let Some(metadata) = self.metadata() else {
            return Ok(0);
        };
        let targets: Vec<NodeEndpoint> = metadata
            .replicas_of(self.name(), self.config.replication_factor)
            .into_iter()
            .cloned()
            .collect();

        let client = self.client.clone();
        self.replication
            .replicate(&self.store, &targets, |target: NodeEndpoint| {
                let client = client.clone();
                async move { Connection::connect(&target.address(), &client).await }
            })
            .await
    }

    pub fn request_shutdown(&self) {
        tracing::info!("Node {}: shutdown requested", self.name());
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// A bound storage node
pub struct NodeServer {
    state: Arc<NodeState>,
    listener: TcpListener,
}

impl NodeServer {
    /// Open the store and bind `config.bind_addr`.
    pub async fn bind(config: NodeConfig, client: ClientConfig) -> Result<Self> {
        let bind_addr = config.bind_addr;
        let state = Arc::new(NodeState::open(config, client)?);
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<NodeState> {
        self.state.clone()
    }

    /// Accept connections until a shutdown is requested.
    pub async fn serve(self) -> Result<()> {
        let state = self.state;
        tracing::info!("Starting storage node: {}", state.name());
        tracing::info!("  Listening on: {}", self.listener.local_addr()?);
        tracing::info!("  Data path: {}", state.config().data_dir.display());
        tracing::info!(
            "  Cache: {} ({} entries)",
            state.config().cache_strategy,
            state.config().cache_size
        );

        let replication = tokio::spawn(replication_loop(state.clone()));
        let mut shutdown = state.subscribe_shutdown();

        tracing::info!("✓ Storage node ready");

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session::run(state, socket, peer).await {
                                tracing::debug!("Session with {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        replication.abort();
        tracing::info!("Storage node {} stopped", state.name());
        Ok(())
    }
}

async fn replication_loop(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config().replication_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if state.serving() == ServingState::Stopped {
            continue;
        }
        match state.replicate_once().await {
            Ok(0) => {}
            Ok(pushed) => tracing::debug!("Replicated {} entries", pushed),
            Err(e) => tracing::warn!("Replication round incomplete: {}", e),
        }
    }
}
