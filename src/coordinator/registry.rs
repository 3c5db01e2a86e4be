//! Coordination registry: a watched tree of paths
//!
//! The ECS records launched nodes under `/nodes/<name>`. Change events are
//! advisory; consumers re-read `children` when one arrives (or when they
//! fell behind) instead of trusting the event payload.

use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

/// Parent path of node entries
pub const NODES_PATH: &str = "/nodes";

const EVENT_CAPACITY: usize = 256;

/// Path of a node's registry entry.
pub fn node_path(name: &str) -> String {
    format!("{}/{}", NODES_PATH, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Tied to the creator's session; removed when the creator goes away
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created(String),
    Deleted(String),
    /// Events were lost; re-read the state
    Resync,
}

impl RegistryEvent {
    fn path(&self) -> Option<&str> {
        match self {
            RegistryEvent::Created(path) | RegistryEvent::Deleted(path) => Some(path),
            RegistryEvent::Resync => None,
        }
    }
}

/// Watch-based path registry
pub trait Registry: Send + Sync {
    /// Create `path`; fails if it exists.
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `path`; `false` if it did not exist.
    fn delete(&self, path: &str) -> Result<bool>;

    /// Names of the direct children of `parent`.
    fn children(&self, parent: &str) -> Result<Vec<String>>;

    /// Subscribe to changes below `prefix`.
    fn watch(&self, prefix: &str) -> RegistryWatch;
}

/// Stream of events below one prefix
pub struct RegistryWatch {
    prefix: String,
    events: broadcast::Receiver<RegistryEvent>,
}

impl RegistryWatch {
    pub fn new(prefix: impl Into<String>, events: broadcast::Receiver<RegistryEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            events,
        }
    }

    /// `path` is the prefix itself or lies below it.
    fn covers(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str()).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/')
        })
    }

    /// Next relevant event; `None` once the registry is gone.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => match event.path() {
                    Some(path) if !self.covers(path) => continue,
                    _ => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Registry watch lagged by {} events", skipped);
                    return Some(RegistryEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process registry
pub struct MemoryRegistry {
    entries: RwLock<BTreeMap<String, (Vec<u8>, CreateMode)>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drop every ephemeral entry, as if the owning session expired.
    pub fn expire_ephemeral(&self) -> usize {
        let expired: Vec<String> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let paths: Vec<String> = entries
                .iter()
                .filter(|(_, (_, mode))| *mode == CreateMode::Ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                entries.remove(path);
            }
            paths
        };
        let count = expired.len();
        for path in expired {
            self.publish(RegistryEvent::Deleted(path));
        }
        count
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(Error::Registry(format!("invalid path: {}", path)));
    }
    Ok(())
}

impl Registry for MemoryRegistry {
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.contains_key(path) {
                return Err(Error::Registry(format!("{} already exists", path)));
            }
            entries.insert(path.to_string(), (data, mode));
        }
        self.publish(RegistryEvent::Created(path.to_string()));
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_path(path)?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|(data, _)| data.clone()))
    }

    fn delete(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some();
        if removed {
            self.publish(RegistryEvent::Deleted(path.to_string()));
        }
        Ok(removed)
    }

    fn children(&self, parent: &str) -> Result<Vec<String>> {
        validate_path(parent)?;
        let prefix = format!("{}/", parent);
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn watch(&self, prefix: &str) -> RegistryWatch {
        RegistryWatch::new(prefix, self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_read_delete() {
        let registry = MemoryRegistry::new();
        registry
            .create(&node_path("n1"), b"127.0.0.1:5000".to_vec(), CreateMode::Persistent)
            .unwrap();
        assert!(registry
            .create(&node_path("n1"), Vec::new(), CreateMode::Persistent)
            .is_err());

        assert_eq!(
            registry.read(&node_path("n1")).unwrap().as_deref(),
            Some(&b"127.0.0.1:5000"[..])
        );
        assert!(registry.delete(&node_path("n1")).unwrap());
        assert!(!registry.delete(&node_path("n1")).unwrap());
        assert!(registry.read(&node_path("n1")).unwrap().is_none());
    }

    #[test]
    fn test_children_are_direct_only() {
        let registry = MemoryRegistry::new();
        for path in ["/nodes/a", "/nodes/b", "/nodes/b/deep", "/other/c"] {
            registry.create(path, Vec::new(), CreateMode::Persistent).unwrap();
        }
        assert_eq!(registry.children(NODES_PATH).unwrap(), vec!["a", "b"]);
        assert!(registry.children("nodes").is_err());
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch(NODES_PATH);

        registry.create("/other/x", Vec::new(), CreateMode::Persistent).unwrap();
        registry.create("/nodes/a", Vec::new(), CreateMode::Ephemeral).unwrap();
        assert_eq!(registry.expire_ephemeral(), 1);

        assert_eq!(
            watch.next().await,
            Some(RegistryEvent::Created("/nodes/a".into()))
        );
        assert_eq!(
            watch.next().await,
            Some(RegistryEvent::Deleted("/nodes/a".into()))
        );
    }

    #[tokio::test]
    async fn test_watch_ignores_sibling_with_shared_prefix() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch(NODES_PATH);

        registry.create("/nodesX/a", Vec::new(), CreateMode::Persistent).unwrap();
        registry.create(&node_path("b"), Vec::new(), CreateMode::Persistent).unwrap();
        assert_eq!(
            watch.next().await,
            Some(RegistryEvent::Created(node_path("b")))
        );
    }

    #[tokio::test]
    async fn test_lagging_watch_resyncs() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch(NODES_PATH);
        for i in 0..(EVENT_CAPACITY + 10) {
            registry
                .create(&node_path(&format!("n{}", i)), Vec::new(), CreateMode::Persistent)
                .unwrap();
        }
        assert_eq!(watch.next().await, Some(RegistryEvent::Resync));
    }

    #[test]
    fn test_watch_waits_for_relevant_event() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch(NODES_PATH);
        let mut next = tokio_test::task::spawn(watch.next());
        tokio_test::assert_pending!(next.poll());

        registry.create("/other/x", Vec::new(), CreateMode::Persistent).unwrap();
        tokio_test::assert_pending!(next.poll());

        registry.create(&node_path("a"), Vec::new(), CreateMode::Persistent).unwrap();
        assert!(next.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(next.poll()),
            Some(RegistryEvent::Created(node_path("a")))
        );
    }
}
