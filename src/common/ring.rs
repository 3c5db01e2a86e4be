//! Ring metadata: which node owns which slice of the hash ring
//!
//! A node at position `p` owns `(predecessor.position, p]`. The node with the
//! smallest position also owns everything above the largest position (wrap).
//! `Metadata` is an immutable snapshot; membership changes build a new one.

use crate::common::hash::{node_position, KeyHasher, RingPosition};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A storage node as seen on the ring
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub position: RingPosition,
}

impl NodeEndpoint {
    /// Endpoint placed on the ring by hashing `host:port`.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        hasher: &dyn KeyHasher,
    ) -> Self {
        let host = host.into();
        let position = node_position(hasher, &host, port);
        Self {
            name: name.into(),
            host,
            port,
            position,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Sorted, immutable table of ring members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    nodes: Vec<NodeEndpoint>,
}

impl Metadata {
    pub fn new(mut nodes: Vec<NodeEndpoint>) -> Self {
        let mut seen = std::collections::HashSet::new();
        nodes.retain(|n| seen.insert(n.name.clone()));
        nodes.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        // two nodes on one position would both claim the whole ring
        nodes.dedup_by(|later, kept| {
            let clash = later.position == kept.position;
            if clash {
                tracing::warn!("{} shares position {} with {}, dropped", later, later.position, kept);
            }
            clash
        });
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NodeEndpoint> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Node owning `key`.
    pub fn resolve(&self, hasher: &dyn KeyHasher, key: &str) -> Result<&NodeEndpoint> {
        self.resolve_position(&hasher.position_of(key))
    }

    /// Smallest node position >= `position`, wrapping to the first node.
    pub fn resolve_position(&self, position: &RingPosition) -> Result<&NodeEndpoint> {
        if self.nodes.is_empty() {
            return Err(Error::NoNodeAvailable);
        }
        let idx = self.nodes.partition_point(|n| &n.position < position);
        Ok(&self.nodes[idx % self.nodes.len()])
    }

    pub fn predecessor(&self, name: &str) -> Option<&NodeEndpoint> {
        let idx = self.index_of(name)?;
        let len = self.nodes.len();
        Some(&self.nodes[(idx + len - 1) % len])
    }

    pub fn successor(&self, name: &str) -> Option<&NodeEndpoint> {
        let idx = self.index_of(name)?;
        Some(&self.nodes[(idx + 1) % self.nodes.len()])
    }

    /// `(start, end]` owned by `name`.
    pub fn range_of(&self, name: &str) -> Option<(RingPosition, RingPosition)> {
        let node = self.get(name)?;
        let pred = self.predecessor(name)?;
        Some((pred.position.clone(), node.position.clone()))
    }

    /// Does `name` own `position`?
    pub fn is_responsible(&self, name: &str, position: &RingPosition) -> bool {
        match self.range_of(name) {
            Some((start, end)) => position.in_range(&start, &end),
            None => false,
        }
    }

    /// The next `n` distinct successors of `name` (never `name` itself).
    pub fn replicas_of(&self, name: &str, n: usize) -> Vec<&NodeEndpoint> {
        let Some(idx) = self.index_of(name) else {
            return Vec::new();
        };
        let len = self.nodes.len();
        (1..len)
            .take(n)
            .map(|step| &self.nodes[(idx + step) % len])
            .collect()
    }

    /// Nodes whose replicas include `name` (the ranges `name` holds copies of).
    pub fn replicated_by(&self, name: &str, n: usize) -> Vec<&NodeEndpoint> {
        self.nodes
            .iter()
            .filter(|owner| {
                owner.name != name
                    && self
                        .replicas_of(&owner.name, n)
                        .iter()
                        .any(|r| r.name == name)
            })
            .collect()
    }

    /// May `name` serve a read for `position` (owner or one of its `n` replicas)?
    pub fn is_readable_by(&self, name: &str, position: &RingPosition, n: usize) -> bool {
        match self.resolve_position(position) {
            Ok(owner) if owner.name == name => true,
            Ok(owner) => self
                .replicas_of(&owner.name, n)
                .iter()
                .any(|r| r.name == name),
            Err(_) => false,
        }
    }

    /// New snapshot including `endpoint` (replacing a node of the same name).
    pub fn with_node(&self, endpoint: NodeEndpoint) -> Metadata {
        let mut nodes: Vec<NodeEndpoint> = self
            .nodes
            .iter()
            .filter(|n| n.name != endpoint.name)
            .cloned()
            .collect();
        nodes.push(endpoint);
        Metadata::new(nodes)
    }

    /// New snapshot without `name`.
    pub fn without_node(&self, name: &str) -> Metadata {
        Metadata::new(
            self.nodes
                .iter()
                .filter(|n| n.name != name)
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::hash::DigestHasher;
    use rand::Rng;

    fn endpoint(name: &str, position: &str) -> NodeEndpoint {
        NodeEndpoint {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            position: RingPosition::from_hex(position),
        }
    }

    fn three_nodes() -> Metadata {
        Metadata::new(vec![
            endpoint("c", "c0"),
            endpoint("a", "40"),
            endpoint("b", "80"),
        ])
    }

    #[test]
    fn test_sorted_by_position() {
        let meta = three_nodes();
        let names: Vec<_> = meta.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_shared_position_keeps_one_node() {
        let meta = Metadata::new(vec![
            endpoint("z", "80"),
            endpoint("a", "40"),
            endpoint("b", "80"),
        ]);
        assert_eq!(meta.len(), 2);
        assert!(meta.get("z").is_none());
        assert_eq!(
            meta.range_of("b"),
            Some((RingPosition::from_hex("40"), RingPosition::from_hex("80")))
        );
    }

    #[test]
    fn test_resolve_position() {
        let meta = three_nodes();
        assert_eq!(meta.resolve_position(&RingPosition::from_hex("10")).unwrap().name, "a");
        assert_eq!(meta.resolve_position(&RingPosition::from_hex("40")).unwrap().name, "a");
        assert_eq!(meta.resolve_position(&RingPosition::from_hex("41")).unwrap().name, "b");
        assert_eq!(meta.resolve_position(&RingPosition::from_hex("c0")).unwrap().name, "c");
        // wraps to the smallest position
        assert_eq!(meta.resolve_position(&RingPosition::from_hex("c1")).unwrap().name, "a");
    }

    #[test]
    fn test_resolve_empty() {
        let meta = Metadata::default();
        let hasher = DigestHasher::default();
        assert!(matches!(
            meta.resolve(&hasher, "key"),
            Err(Error::NoNodeAvailable)
        ));
    }

    #[test]
    fn test_ranges() {
        let meta = three_nodes();
        let (start, end) = meta.range_of("a").unwrap();
        assert_eq!(start.as_str(), "c0");
        assert_eq!(end.as_str(), "40");
        assert!(meta.is_responsible("a", &RingPosition::from_hex("ff")));
        assert!(meta.is_responsible("b", &RingPosition::from_hex("80")));
        assert!(!meta.is_responsible("b", &RingPosition::from_hex("81")));
    }

    #[test]
    fn test_single_node_owns_everything() {
        let meta = Metadata::new(vec![endpoint("solo", "77")]);
        for p in ["00", "77", "78", "ff"] {
            assert!(meta.is_responsible("solo", &RingPosition::from_hex(p)));
        }
        assert!(meta.replicas_of("solo", 2).is_empty());
    }

    #[test]
    fn test_replicas() {
        let meta = three_nodes();
        let replicas: Vec<_> = meta.replicas_of("b", 2).iter().map(|n| n.name.clone()).collect();
        assert_eq!(replicas, vec!["c", "a"]);
        let two: Vec<_> = Metadata::new(vec![endpoint("x", "10"), endpoint("y", "20")])
            .replicas_of("x", 2)
            .iter()
            .map(|n| n.name.clone())
            .collect();
        assert_eq!(two, vec!["y"]);

        let held: Vec<_> = meta.replicated_by("a", 1).iter().map(|n| n.name.clone()).collect();
        assert_eq!(held, vec!["c"]);
    }

    #[test]
    fn test_readable_by_replicas() {
        let meta = three_nodes();
        let pos = RingPosition::from_hex("50"); // owned by b
        assert!(meta.is_readable_by("b", &pos, 1));
        assert!(meta.is_readable_by("c", &pos, 1));
        assert!(!meta.is_readable_by("a", &pos, 1));
        assert!(meta.is_readable_by("a", &pos, 2));
    }

    #[test]
    fn test_with_and_without_node() {
        let meta = three_nodes();
        let grown = meta.with_node(endpoint("d", "a0"));
        assert_eq!(grown.len(), 4);
        assert_eq!(meta.len(), 3);
        assert_eq!(grown.range_of("c").unwrap().0.as_str(), "a0");

        let shrunk = grown.without_node("b");
        assert_eq!(shrunk.len(), 3);
        assert_eq!(shrunk.range_of("d").unwrap().0.as_str(), "40");
    }

    #[test]
    fn test_ring_coverage() {
        let hasher = DigestHasher::new(4);
        let mut rng = rand::thread_rng();

        for round in 0..20 {
            let count = rng.gen_range(1..8);
            let nodes: Vec<NodeEndpoint> = (0..count)
                .map(|i| NodeEndpoint::new(format!("n{}-{}", round, i), "10.0.0.1", 5000 + i, &hasher))
                .collect();
            let meta = Metadata::new(nodes);

            for _ in 0..200 {
                let pos = RingPosition::from_hex(format!("{:08x}", rng.gen::<u32>()));
                let owners: Vec<_> = meta
                    .nodes()
                    .iter()
                    .filter(|n| meta.is_responsible(&n.name, &pos))
                    .collect();
                assert_eq!(owners.len(), 1, "position {} owned by {:?}", pos, owners);
                assert_eq!(owners[0].name, meta.resolve_position(&pos).unwrap().name);
            }
        }
    }
}
