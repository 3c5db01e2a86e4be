//! Hashing utilities for ringkv
//!
//! - BLAKE3 digests, truncated and hex encoded, place keys and nodes on the ring
//! - The leading hex characters of a position select the shard file

use serde::{Deserialize, Serialize};

/// Default number of digest bytes kept for a ring position (32 hex chars)
pub const DEFAULT_PREFIX_BYTES: usize = 16;

/// A position on the hash ring.
///
/// Fixed-length lowercase hex, so lexicographic order is numeric order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RingPosition(String);

impl RingPosition {
    /// Wrap an already encoded position (lowercased).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading `len` hex characters (the shard key).
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    /// Is `self` inside the ring range `(start, end]`?
    ///
    /// `start == end` covers the whole ring (a single owner).
    pub fn in_range(&self, start: &RingPosition, end: &RingPosition) -> bool {
        if start < end {
            self > start && self <= end
        } else {
            self > start || self <= end
        }
    }
}

impl std::fmt::Display for RingPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps keys (and node identities) to ring positions.
///
/// Implementations hold no mutable state and can be shared across tasks.
pub trait KeyHasher: Send + Sync {
    fn position(&self, key: &[u8]) -> RingPosition;

    fn position_of(&self, key: &str) -> RingPosition {
        self.position(key.as_bytes())
    }
}

/// BLAKE3 digest truncated to `prefix_bytes` leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestHasher {
    prefix_bytes: usize,
}

impl DigestHasher {
    pub fn new(prefix_bytes: usize) -> Self {
        Self {
            prefix_bytes: prefix_bytes.clamp(1, blake3::OUT_LEN),
        }
    }

    pub fn prefix_bytes(&self) -> usize {
        self.prefix_bytes
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX_BYTES)
    }
}

impl KeyHasher for DigestHasher {
    fn position(&self, key: &[u8]) -> RingPosition {
        let hash = blake3::hash(key);
        RingPosition(hex::encode(&hash.as_bytes()[..self.prefix_bytes]))
    }
}

/// Ring position of a node, derived from its address.
pub fn node_position(hasher: &dyn KeyHasher, host: &str, port: u16) -> RingPosition {
    hasher.position_of(&format!("{}:{}", host, port))
}
