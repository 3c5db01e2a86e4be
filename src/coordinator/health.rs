//! Periodic liveness checks of launched nodes
//!
//! A node that misses `MAX_MISSES` checks in a row loses its registry entry;
//! the controller's registry watch then takes it out of the ring.

use crate::common::NodeEndpoint;
use crate::coordinator::admin::AdminClient;
use crate::coordinator::controller::Controller;
use crate::coordinator::launcher::Launcher;
use crate::coordinator::registry::{node_path, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Consecutive failed checks before a node is declared dead
pub const MAX_MISSES: u32 = 2;

pub struct HealthChecker {
    admin: AdminClient,
    registry: Arc<dyn Registry>,
    interval: Duration,
    misses: HashMap<String, u32>,
}

impl HealthChecker {
    pub fn new(admin: AdminClient, registry: Arc<dyn Registry>, interval: Duration) -> Self {
        Self {
            admin,
            registry,
            interval,
            misses: HashMap::new(),
        }
    }

    /// Check `nodes` once; returns the names whose entry was removed.
    pub async fn check(&mut self, nodes: &[NodeEndpoint]) -> Vec<String> {
        self.misses
            .retain(|name, _| nodes.iter().any(|n| &n.name == name));

        let mut dead = Vec::new();
        for node in nodes {
            match self.admin.ping(node).await {
                Ok(_) => {
                    self.misses.remove(&node.name);
                }
                Err(e) => {
                    let misses = self.misses.entry(node.name.clone()).or_insert(0);
                    *misses += 1;
                    tracing::warn!("Health check of {} failed ({}/{}): {}", node, misses, MAX_MISSES, e);
                    if *misses >= MAX_MISSES {
                        self.misses.remove(&node.name);
                        dead.push(node.name.clone());
                    }
                }
            }
        }

        for name in &dead {
            match self.registry.delete(&node_path(name)) {
                Ok(_) => tracing::warn!("Node {} declared dead", name),
                Err(e) => tracing::error!("Cannot remove registry entry of {}: {}", name, e),
            }
        }
        dead
    }

    /// Check the controller's ring every interval while the controller lives.
    pub fn spawn<L: Launcher + 'static>(mut self, controller: Arc<Controller<L>>) -> JoinHandle<()> {
        let controller = Arc::downgrade(&controller);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                let nodes = controller.metadata().nodes().to_vec();
                drop(controller);
                if !nodes.is_empty() {
                    self.check(&nodes).await;
                }
            }
        })
    }
}
