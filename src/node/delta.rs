//! Accumulated writes for one owned range

use crate::common::RingPosition;
use std::collections::BTreeMap;

/// Writes recorded since a logical point in time.
///
/// Keys are kept in order and the last write per key wins; `None` is a
/// tombstone. Not synchronized: the replication engine owns every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDelta {
    logical_time: u64,
    range_start: RingPosition,
    range_end: RingPosition,
    entries: BTreeMap<String, Option<String>>,
}

impl StorageDelta {
    pub fn new(logical_time: u64, range_start: RingPosition, range_end: RingPosition) -> Self {
        Self {
            logical_time,
            range_start,
            range_end,
            entries: BTreeMap::new(),
        }
    }

    pub fn logical_time(&self) -> u64 {
        self.logical_time
    }

    pub fn range(&self) -> (&RingPosition, &RingPosition) {
        (&self.range_start, &self.range_end)
    }

    pub fn record(&mut self, key: impl Into<String>, value: Option<String>) {
        self.entries.insert(key.into(), value);
    }

    /// Fold a newer delta into this one.
    pub fn merge(&mut self, newer: StorageDelta) {
        self.logical_time = self.logical_time.max(newer.logical_time);
        self.range_start = newer.range_start;
        self.range_end = newer.range_end;
        self.entries.extend(newer.entries);
    }

    /// Last write recorded for `key`; `Some(None)` is a tombstone.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries.get(key).map(Option::as_deref)
    }

    /// Keep only the entries `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, Option<&str>) -> bool) {
        self.entries.retain(|k, v| keep(k, v.as_deref()));
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// The same delta without its first `skip` entries.
    pub fn tail(&self, skip: usize) -> StorageDelta {
        Self {
            logical_time: self.logical_time,
            range_start: self.range_start.clone(),
            range_end: self.range_end.clone(),
            entries: self
                .entries
                .iter()
                .skip(skip)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
