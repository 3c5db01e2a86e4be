//! Launch state of storage nodes as tracked by the ECS

use crate::common::{CacheStrategy, Error, NodeEndpoint, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycle {
    NotLaunched,
    Launching,
    Launched,
}

impl NodeLifecycle {
    /// Allowed moves: launch attempt, its outcome, removal/crash.
    pub fn can_transition_to(self, next: NodeLifecycle) -> bool {
        matches!(
            (self, next),
            (NodeLifecycle::NotLaunched, NodeLifecycle::Launching)
                | (NodeLifecycle::Launching, NodeLifecycle::Launched)
                | (NodeLifecycle::Launching, NodeLifecycle::NotLaunched)
                | (NodeLifecycle::Launched, NodeLifecycle::NotLaunched)
        )
    }
}

impl std::fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeLifecycle::NotLaunched => write!(f, "not-launched"),
            NodeLifecycle::Launching => write!(f, "launching"),
            NodeLifecycle::Launched => write!(f, "launched"),
        }
    }
}

/// A pool slot known to the ECS
#[derive(Debug, Clone)]
pub struct EcsNode {
    pub endpoint: NodeEndpoint,
    pub cache_strategy: CacheStrategy,
    pub cache_size: usize,
    lifecycle: NodeLifecycle,
}

impl EcsNode {
    pub fn new(endpoint: NodeEndpoint) -> Self {
        Self {
            endpoint,
            cache_strategy: CacheStrategy::Fifo,
            cache_size: 0,
            lifecycle: NodeLifecycle::NotLaunched,
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn lifecycle(&self) -> NodeLifecycle {
        self.lifecycle
    }

    pub fn is_launched(&self) -> bool {
        self.lifecycle == NodeLifecycle::Launched
    }

    pub fn is_available(&self) -> bool {
        self.lifecycle == NodeLifecycle::NotLaunched
    }

    fn transition(&mut self, next: NodeLifecycle) -> Result<()> {
        if !self.lifecycle.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                node: self.endpoint.name.clone(),
                from: self.lifecycle.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("{}: {} -> {}", self.endpoint.name, self.lifecycle, next);
        self.lifecycle = next;
        Ok(())
    }

    /// Reserve the slot for a launch with the given cache settings.
    pub fn begin_launch(&mut self, strategy: CacheStrategy, cache_size: usize) -> Result<()> {
        self.transition(NodeLifecycle::Launching)?;
        self.cache_strategy = strategy;
        self.cache_size = cache_size;
        Ok(())
    }

    pub fn launch_succeeded(&mut self) -> Result<()> {
        self.transition(NodeLifecycle::Launched)
    }

    pub fn launch_failed(&mut self) -> Result<()> {
        self.transition(NodeLifecycle::NotLaunched)
    }

    /// The node left the ring (removed or crashed).
    pub fn mark_removed(&mut self) -> Result<()> {
        if self.lifecycle != NodeLifecycle::Launched {
            return Err(Error::InvalidTransition {
                node: self.endpoint.name.clone(),
                from: self.lifecycle.to_string(),
                to: NodeLifecycle::NotLaunched.to_string(),
            });
        }
        self.transition(NodeLifecycle::NotLaunched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DigestHasher;

    fn node() -> EcsNode {
        EcsNode::new(NodeEndpoint::new("n1", "127.0.0.1", 5000, &DigestHasher::default()))
    }

    #[test]
    fn test_launch_cycle() {
        let mut n = node();
        assert!(n.is_available());
        n.begin_launch(CacheStrategy::Lru, 10).unwrap();
        assert_eq!(n.lifecycle(), NodeLifecycle::Launching);
        assert_eq!(n.cache_strategy, CacheStrategy::Lru);
        n.launch_succeeded().unwrap();
        assert!(n.is_launched());
        n.mark_removed().unwrap();
        assert!(n.is_available());
    }

    #[test]
    fn test_failed_launch_returns_to_pool() {
        let mut n = node();
        n.begin_launch(CacheStrategy::Fifo, 10).unwrap();
        n.launch_failed().unwrap();
        assert!(n.is_available());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut n = node();
        assert!(matches!(
            n.launch_succeeded(),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(n.mark_removed().is_err());

        n.begin_launch(CacheStrategy::Fifo, 10).unwrap();
        assert!(n.begin_launch(CacheStrategy::Fifo, 10).is_err());
        assert!(n.mark_removed().is_err());
        assert_eq!(n.lifecycle(), NodeLifecycle::Launching);
    }
}
