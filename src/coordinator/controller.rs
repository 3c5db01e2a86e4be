//! External configuration service: launches nodes and rebalances the ring
//!
//! Topology changes (init, add, remove, crash handling) run one at a time
//! under the controller lock. Each change follows the same hand-off:
//! - compute the new metadata snapshot
//! - write-lock the node giving up a range and transfer that range
//! - distribute the new metadata
//! - unlock and clean up

use crate::common::{
    CacheStrategy, ClientConfig, EcsConfig, Error, KeyHasher, Metadata, NodeEndpoint, Result,
    RingPosition,
};
use crate::coordinator::admin::AdminClient;
use crate::coordinator::launcher::{LaunchSpec, Launcher};
use crate::coordinator::lifecycle::EcsNode;
use crate::coordinator::registry::{node_path, CreateMode, Registry, RegistryEvent, NODES_PATH};
use crate::protocol::AdminCommand;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;

/// Range a joining node takes over, and the node giving it up
type Handoff = (NodeEndpoint, (RingPosition, RingPosition));

struct ControllerInner {
    nodes: Vec<EcsNode>,
    /// Set by `start`; nodes added later are started right away
    started: bool,
}

impl ControllerInner {
    fn launched(&self) -> Vec<NodeEndpoint> {
        self.nodes
            .iter()
            .filter(|n| n.is_launched())
            .map(|n| n.endpoint.clone())
            .collect()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    /// Up to `count` random free slots, skipping `exclude`.
    fn pick_available(&self, count: usize, exclude: &HashSet<String>) -> Vec<usize> {
        let free: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_available() && !exclude.contains(n.name()))
            .map(|(i, _)| i)
            .collect();
        free.choose_multiple(&mut rand::thread_rng(), count)
            .copied()
            .collect()
    }
}

pub struct Controller<L: Launcher> {
    config: EcsConfig,
    launcher: L,
    registry: Arc<dyn Registry>,
    admin: AdminClient,
    inner: tokio::sync::Mutex<ControllerInner>,
    metadata: RwLock<Arc<Metadata>>,
}

impl<L: Launcher> Controller<L> {
    pub fn new(
        config: EcsConfig,
        client: ClientConfig,
        hasher: &dyn KeyHasher,
        launcher: L,
        registry: Arc<dyn Registry>,
    ) -> Self {
        let nodes = config
            .pool
            .iter()
            .map(|entry| EcsNode::new(NodeEndpoint::new(&entry.name, &entry.host, entry.port, hasher)))
            .collect();

        Self {
            config,
            launcher,
            registry,
            admin: AdminClient::new(client),
            inner: tokio::sync::Mutex::new(ControllerInner {
                nodes,
                started: false,
            }),
            metadata: RwLock::new(Arc::new(Metadata::default())),
        }
    }

    /// Current ring as distributed to the nodes.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn admin(&self) -> &AdminClient {
        &self.admin
    }

    /// Snapshot of every pool slot.
    pub async fn nodes(&self) -> Vec<EcsNode> {
        self.inner.lock().await.nodes.clone()
    }

    /// Install `metadata` locally and send it to every node it lists.
    async fn publish(&self, metadata: Metadata) -> Arc<Metadata> {
        let metadata = Arc::new(metadata);
        *self
            .metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner) = metadata.clone();

        let failures = self
            .admin
            .broadcast(
                metadata.nodes(),
                AdminCommand::UpdateMetadata((*metadata).clone()),
            )
            .await;
        if !failures.is_empty() {
            tracing::warn!("{} node(s) missed the metadata update", failures.len());
        }
        tracing::info!("Published metadata with {} nodes", metadata.len());
        metadata
    }

    /// Launch one slot and wait for it; registers `/nodes/<name>` on success.
    async fn launch(
        &self,
        inner: &mut ControllerInner,
        idx: usize,
        strategy: CacheStrategy,
        cache_size: usize,
    ) -> Result<NodeEndpoint> {
        inner.nodes[idx].begin_launch(strategy, cache_size)?;
        let endpoint = inner.nodes[idx].endpoint.clone();
        let spec = LaunchSpec {
            node_name: endpoint.name.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            cache_strategy: strategy,
            cache_size,
            registry_addr: self.config.registry_addr.clone(),
        };

        let started = match self.launcher.launch(&spec).await {
            Ok(()) => self
                .admin
                .wait_reachable(&endpoint, self.config.launch_wait())
                .await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            tracing::warn!("Launch of {} failed: {}", endpoint, e);
            inner.nodes[idx].launch_failed()?;
            return Err(e);
        }

        inner.nodes[idx].launch_succeeded()?;
        let path = node_path(&endpoint.name);
        // stale entry from an earlier run of the same slot
        self.registry.delete(&path)?;
        self.registry
            .create(&path, endpoint.address().into_bytes(), CreateMode::Ephemeral)?;
        tracing::info!("Launched {}", endpoint);
        Ok(endpoint)
    }

    /// Launch `count` random pool nodes and hand them the initial ring.
    pub async fn init_service(
        &self,
        count: usize,
        strategy: CacheStrategy,
        cache_size: usize,
    ) -> Result<Vec<NodeEndpoint>> {
        let mut inner = self.inner.lock().await;
        let picks = inner.pick_available(count, &HashSet::new());
        if picks.len() < count {
            tracing::warn!("Pool has {} free nodes, {} requested", picks.len(), count);
        }

        let mut launched = Vec::new();
        for idx in picks {
            match self.launch(&mut inner, idx, strategy, cache_size).await {
                Ok(endpoint) => launched.push(endpoint),
                Err(e) => tracing::warn!("Skipping node: {}", e),
            }
        }
        if launched.is_empty() {
            return Err(Error::NoNodeAvailable);
        }

        self.publish(Metadata::new(inner.launched())).await;
        Ok(launched)
    }

    /// Launch one more node and move its range over from its successor.
    pub async fn add_node(&self, strategy: CacheStrategy, cache_size: usize) -> Result<NodeEndpoint> {
        let mut inner = self.inner.lock().await;
        self.add_node_locked(&mut inner, strategy, cache_size, &HashSet::new())
            .await
    }

    async fn add_node_locked(
        &self,
        inner: &mut ControllerInner,
        strategy: CacheStrategy,
        cache_size: usize,
        exclude: &HashSet<String>,
    ) -> Result<NodeEndpoint> {
        let Some(idx) = inner.pick_available(1, exclude).first().copied() else {
            return Err(Error::NoNodeAvailable);
        };
        let endpoint = self.launch(inner, idx, strategy, cache_size).await?;

        let current = self.metadata();
        let updated = current.with_node(endpoint.clone());
        let handoff = match (updated.successor(&endpoint.name), updated.range_of(&endpoint.name)) {
            (Some(successor), Some(range)) if successor.name != endpoint.name => {
                Some((successor.clone(), range))
            }
            _ => None,
        };

        if let Err(e) = self.prepare_join(&endpoint, &updated, handoff.as_ref()).await {
            tracing::warn!("Hand-off to {} failed, rolling back: {}", endpoint, e);
            if let Some((successor, _)) = &handoff {
                let _ = self.admin.send(successor, AdminCommand::UnlockWrite).await;
            }
            let _ = self.admin.send(&endpoint, AdminCommand::Shutdown).await;
            inner.nodes[idx].mark_removed()?;
            self.registry.delete(&node_path(&endpoint.name))?;
            return Err(e);
        }

        self.publish(updated).await;
        if inner.started {
            self.admin.send(&endpoint, AdminCommand::Start).await?;
        }

        if let Some((successor, (start, end))) = handoff {
            self.admin.send(&successor, AdminCommand::UnlockWrite).await?;
            self.admin
                .send(&successor, AdminCommand::RemoveRange { start, end })
                .await?;
        }

        tracing::info!("Node {} joined the ring", endpoint);
        Ok(endpoint)
    }

    /// Everything a join needs before the new ring is published: the new
    /// node learns the ring, and the successor write-locks and copies the
    /// range over.
    async fn prepare_join(
        &self,
        endpoint: &NodeEndpoint,
        updated: &Metadata,
        handoff: Option<&Handoff>,
    ) -> Result<()> {
        if updated.get(&endpoint.name).is_none() {
            return Err(Error::InvalidAddress(format!(
                "{} shares its ring position with a member",
                endpoint
            )));
        }
        self.admin
            .send(endpoint, AdminCommand::UpdateMetadata(updated.clone()))
            .await?;
        if let Some((successor, (start, end))) = handoff {
            self.admin.send(successor, AdminCommand::LockWrite).await?;
            let transfer = AdminCommand::Transfer {
                target: endpoint.clone(),
                start: start.clone(),
                end: end.clone(),
            };
            self.admin.send(successor, transfer).await?;
        }
        Ok(())
    }

    /// Move a node's range to its successor and shut it down.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .index_of(name)
            .filter(|&i| inner.nodes[i].is_launched())
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        let endpoint = inner.nodes[idx].endpoint.clone();

        let current = self.metadata();
        let reduced = current.without_node(name);

        if reduced.is_empty() {
            tracing::warn!("Removing the last node {}; its data stays on disk", name);
            *self
                .metadata
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Arc::new(reduced);
        } else {
            let successor = current
                .successor(name)
                .cloned()
                .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
            let (start, end) = current
                .range_of(name)
                .ok_or_else(|| Error::UnknownNode(name.to_string()))?;

            let transfer = AdminCommand::Transfer {
                target: successor,
                start,
                end,
            };
            let moved = match self.admin.send(&endpoint, AdminCommand::LockWrite).await {
                Ok(()) => self.admin.send(&endpoint, transfer).await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                let _ = self.admin.send(&endpoint, AdminCommand::UnlockWrite).await;
                return Err(e);
            }
            self.publish(reduced).await;
        }

        if let Err(e) = self.admin.send(&endpoint, AdminCommand::Shutdown).await {
            tracing::warn!("Shutdown of {} failed: {}", name, e);
        }
        inner.nodes[idx].mark_removed()?;
        self.registry.delete(&node_path(name))?;
        tracing::info!("Node {} left the ring", name);
        Ok(())
    }

    async fn broadcast_launched(&self, command: AdminCommand) -> Result<()> {
        let nodes = self.inner.lock().await.launched();
        match self.admin.broadcast(&nodes, command).await.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Let every launched node serve clients.
    pub async fn start(&self) -> Result<()> {
        self.inner.lock().await.started = true;
        self.broadcast_launched(AdminCommand::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.lock().await.started = false;
        self.broadcast_launched(AdminCommand::Stop).await
    }

    /// Shut every launched node down and forget the ring.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let nodes = inner.launched();
        let failures = self.admin.broadcast(&nodes, AdminCommand::Shutdown).await;

        for node in inner.nodes.iter_mut().filter(|n| n.is_launched()) {
            node.mark_removed()?;
            self.registry.delete(&node_path(node.name()))?;
        }
        inner.started = false;
        *self
            .metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(Metadata::default());

        tracing::info!("Service shut down ({} nodes)", nodes.len());
        match failures.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reconcile with the registry: nodes whose entry vanished are dropped
    /// from the ring and replaced from the pool when possible.
    pub async fn handle_membership_change(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let present: HashSet<String> = self.registry.children(NODES_PATH)?.into_iter().collect();

        let mut lost = Vec::new();
        for node in inner.nodes.iter_mut() {
            if node.is_launched() && !present.contains(node.name()) {
                node.mark_removed()?;
                lost.push(node.clone());
            }
        }
        if lost.is_empty() {
            return Ok(());
        }

        let names: HashSet<String> = lost.iter().map(|n| n.name().to_string()).collect();
        tracing::warn!("Lost nodes: {:?}", names);
        self.publish(Metadata::new(inner.launched())).await;

        for node in lost {
            match self
                .add_node_locked(&mut inner, node.cache_strategy, node.cache_size, &names)
                .await
            {
                Ok(replacement) => tracing::info!("Replaced {} with {}", node.name(), replacement),
                Err(e) => tracing::warn!("No replacement for {}: {}", node.name(), e),
            }
        }
        Ok(())
    }
}

impl<L: Launcher + 'static> Controller<L> {
    /// React to registry changes below `/nodes` until the registry or the
    /// controller goes away.
    pub fn watch_membership(self: Arc<Self>) -> JoinHandle<()> {
        let mut watch = self.registry.watch(NODES_PATH);
        let controller = Arc::downgrade(&self);
        tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                if matches!(event, RegistryEvent::Created(_)) {
                    continue;
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if let Err(e) = controller.handle_membership_change().await {
                    tracing::error!("Membership change failed: {}", e);
                }
            }
            tracing::debug!("Membership watch stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DigestHasher;
    use crate::coordinator::registry::MemoryRegistry;
    use std::time::Duration;

    struct NoopLauncher;

    impl Launcher for NoopLauncher {
        async fn launch(&self, _spec: &LaunchSpec) -> Result<()> {
            Ok(())
        }
    }

    fn controller(registry: Arc<dyn Registry>) -> Arc<Controller<NoopLauncher>> {
        Arc::new(Controller::new(
            EcsConfig::default(),
            ClientConfig::default(),
            &DigestHasher::default(),
            NoopLauncher,
            registry,
        ))
    }

    #[tokio::test]
    async fn test_watch_ends_with_controller() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());
        let watcher = controller.clone().watch_membership();

        drop(controller);
        registry
            .create(&node_path("n1"), Vec::new(), CreateMode::Ephemeral)
            .unwrap();
        registry.delete(&node_path("n1")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_reconciles_while_controller_lives() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());
        let watcher = controller.clone().watch_membership();

        registry
            .create(&node_path("n1"), Vec::new(), CreateMode::Ephemeral)
            .unwrap();
        registry.delete(&node_path("n1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watcher.is_finished());
        assert!(controller.metadata().is_empty());

        watcher.abort();
    }
}
