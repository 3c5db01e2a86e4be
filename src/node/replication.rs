//! Delta replication from a range owner to its replicas
//!
//! The owner records every accepted write into the current `StorageDelta`.
//! Each round rotates that delta out and folds it into the pending delta of
//! every replica target. A target that has never acknowledged anything (new
//! target, new range) is bootstrapped with a full copy of the range first;
//! deletes it has not seen yet are pushed ahead of that copy, since the copy
//! only carries keys that still exist. Whatever a target fails to
//! acknowledge stays pending for the next round.

use crate::client::Connection;
use crate::common::{Error, NodeEndpoint, Result, RingPosition};
use crate::node::delta::StorageDelta;
use crate::node::store::KvStore;
use crate::protocol::KvMessage;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where replicated writes are pushed.
pub trait ReplicaSink: Send {
    /// Apply one write (`None` deletes); `Ok` once the replica acknowledged it.
    fn push(&mut self, key: &str, value: Option<&str>) -> impl Future<Output = Result<()>> + Send;
}

impl ReplicaSink for Connection {
    async fn push(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        let reply = self
            .request(&KvMessage::replicate(key, value.map(str::to_string)))
            .await?;
        if reply.status.is_write_ack() {
            Ok(())
        } else {
            Err(Error::Protocol(format!("replica answered {}", reply)))
        }
    }
}

/// A push that stopped before the end of its delta
#[derive(Debug)]
pub struct PushFailure {
    pub pushed: usize,
    pub remaining: StorageDelta,
    pub error: Error,
}

#[derive(Debug, Default)]
struct TargetState {
    acked_time: Option<u64>,
    pending: Option<StorageDelta>,
}

#[derive(Debug, Default)]
struct EngineInner {
    clock: u64,
    current: Option<StorageDelta>,
    targets: HashMap<String, TargetState>,
}

/// Per-node replication bookkeeping
#[derive(Debug, Default)]
pub struct ReplicationEngine {
    inner: Mutex<EngineInner>,
    /// One round at a time; pending deltas are taken out while pushing
    round: tokio::sync::Mutex<()>,
}

impl ReplicationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an accepted write; ignored while no range is owned.
    pub fn record(&self, key: &str, value: Option<&str>) {
        if let Some(current) = self.lock().current.as_mut() {
            current.record(key, value.map(str::to_string));
        }
    }

    /// Start tracking a (new) owned range; every target bootstraps again.
    ///
    /// Writes not yet pushed stay pending so the bootstrap can replay their
    /// deletes.
    pub fn reset_baseline(&self, start: RingPosition, end: RingPosition) {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let previous = inner.current.replace(StorageDelta::new(clock, start, end));
        for state in inner.targets.values_mut() {
            state.acked_time = None;
            if let Some(previous) = &previous {
                match state.pending.as_mut() {
                    Some(pending) => pending.merge(previous.clone()),
                    None => state.pending = Some(previous.clone()),
                }
            }
        }
        tracing::debug!("Replication baseline reset at t={}", clock);
    }

    /// Last write recorded for `key` since the previous round.
    pub fn last_recorded(&self, key: &str) -> Option<Option<String>> {
        self.lock()
            .current
            .as_ref()
            .and_then(|current| current.get(key).map(|v| v.map(str::to_string)))
    }

    /// Stop tracking: the node owns nothing.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.current = None;
        inner.targets.clear();
    }

    pub fn logical_time(&self) -> u64 {
        self.lock().clock
    }

    /// Number of writes waiting for the next round.
    pub fn recorded(&self) -> usize {
        self.lock().current.as_ref().map_or(0, StorageDelta::len)
    }

    /// Entries still pending for a target.
    pub fn pending_for(&self, target: &str) -> usize {
        self.lock()
            .targets
            .get(target)
            .and_then(|t| t.pending.as_ref())
            .map_or(0, StorageDelta::len)
    }

    /// Logical time a target last acknowledged.
    pub fn acked_time(&self, target: &str) -> Option<u64> {
        self.lock().targets.get(target).and_then(|t| t.acked_time)
    }

    /// Push every stored record in `(start, end]` to `sink`.
    pub async fn full_sync<S: ReplicaSink>(
        store: &Arc<KvStore>,
        start: &RingPosition,
        end: &RingPosition,
        target: &str,
        sink: &mut S,
    ) -> Result<usize> {
        let entries = {
            let store = store.clone();
            let (start, end) = (start.clone(), end.clone());
            tokio::task::spawn_blocking(move || store.entries_in_range(&start, &end)).await??
        };
        let total = entries.len();

        for (pushed, (key, value)) in entries.iter().enumerate() {
            if let Err(e) = sink.push(key, Some(value)).await {
                tracing::warn!("Full sync to {} stopped at {}/{}: {}", target, pushed, total, e);
                return Err(Error::Replication {
                    target: target.to_string(),
                    pushed,
                    remaining: total - pushed,
                });
            }
        }
        tracing::debug!("Full sync to {}: {} records", target, total);
        Ok(total)
    }

    /// Push a delta in key order; on failure hand back the unacknowledged tail.
    pub async fn push_delta<S: ReplicaSink>(
        delta: &StorageDelta,
        sink: &mut S,
    ) -> std::result::Result<usize, PushFailure> {
        for (pushed, (key, value)) in delta.entries().enumerate() {
            if let Err(error) = sink.push(key, value).await {
                return Err(PushFailure {
                    pushed,
                    remaining: delta.tail(pushed),
                    error,
                });
            }
        }
        Ok(delta.len())
    }

    /// Run one round against `targets`, connecting with `connect`.
    ///
    /// Returns the number of entries pushed. Every target is attempted; the
    /// first failure is returned after the round.
    pub async fn replicate<S, F, Fut>(
        &self,
        store: &Arc<KvStore>,
        targets: &[NodeEndpoint],
        mut connect: F,
    ) -> Result<usize>
    where
        S: ReplicaSink,
        F: FnMut(NodeEndpoint) -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let _round = self.round.lock().await;

        // Rotate the current delta and hand it to every target
        let (time, start, end, work) = {
            let mut inner = self.lock();
            let Some(current) = inner.current.as_mut() else {
                return Ok(0);
            };
            let (start, end) = {
                let (s, e) = current.range();
                (s.clone(), e.clone())
            };
            let next_time = current.logical_time() + 1;
            let rotated =
                std::mem::replace(current, StorageDelta::new(next_time, start.clone(), end.clone()));
            let time = rotated.logical_time();
            inner.clock = inner.clock.max(next_time);

            let listed: HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
            inner.targets.retain(|name, _| listed.contains(name.as_str()));

            let mut work = Vec::with_capacity(targets.len());
            for target in targets {
                let state = inner.targets.entry(target.name.clone()).or_default();
                let mut pending = match state.pending.take() {
                    Some(mut pending) => {
                        pending.merge(rotated.clone());
                        pending
                    }
                    None => rotated.clone(),
                };
                let bootstrap = state.acked_time.is_none();
                if bootstrap {
                    // the full copy carries every live value
                    let storage = store.storage();
                    pending.retain(|key, value| {
                        value.is_none() && storage.position_of(key).in_range(&start, &end)
                    });
                }
                work.push((target.clone(), bootstrap, pending));
            }
            (time, start, end, work)
        };

        let mut total = 0;
        let mut first_error = None;

        for (target, bootstrap, pending) in work {
            let failed = |f: PushFailure| {
                tracing::warn!("Push to {} stopped after {}: {}", target, f.pushed, f.error);
                (
                    Error::Replication {
                        target: target.name.clone(),
                        pushed: f.pushed,
                        remaining: f.remaining.len(),
                    },
                    Some(f.remaining),
                )
            };
            let outcome = match connect(target.clone()).await {
                Ok(mut sink) if bootstrap => {
                    let deletes = Self::push_delta(&pending, &mut sink).await;
                    match deletes {
                        Ok(deleted) => {
                            Self::full_sync(store, &start, &end, &target.name, &mut sink)
                                .await
                                .map(|copied| deleted + copied)
                                .map_err(|e| (e, Some(pending)))
                        }
                        Err(f) => Err(failed(f)),
                    }
                }
                Ok(mut sink) => Self::push_delta(&pending, &mut sink).await.map_err(failed),
                Err(e) => {
                    tracing::warn!("Replica {} unreachable: {}", target, e);
                    Err((
                        Error::Replication {
                            target: target.name.clone(),
                            pushed: 0,
                            remaining: pending.len(),
                        },
                        Some(pending),
                    ))
                }
            };

            let mut inner = self.lock();
            let state = inner.targets.entry(target.name.clone()).or_default();
            match outcome {
                Ok(pushed) => {
                    total += pushed;
                    state.acked_time = Some(time);
                    state.pending = None;
                }
                Err((error, remaining)) => {
                    state.pending = remaining;
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(total),
        }
    }
}
