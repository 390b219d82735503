//! Batched, retried writes to all shards.
//!
//! Every call fans out to all shards concurrently and returns only when each
//! shard has finished, so the caller controls phase ordering: all node
//! batches, then proxy nodes, then relationship batches.

use crate::config::LoaderConfig;
use crate::store::{EdgeWrite, NodeWrite, ShardStore, StoreError};
use graphshard_core::{EntityType, RelationType, ShardId};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Write counters of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardCounts {
    /// Records handed to the store
    pub submitted: usize,
    /// Records the store reports as written
    pub written: usize,
    /// Batches given up after all retries
    pub failed_batches: usize,
    /// Records in given-up batches
    pub failed_records: usize,
    /// Retried batch attempts
    pub retries: usize,
}

impl ShardCounts {
    pub fn merge(&mut self, other: &ShardCounts) {
        self.submitted += other.submitted;
        self.written += other.written;
        self.failed_batches += other.failed_batches;
        self.failed_records += other.failed_records;
        self.retries += other.retries;
    }

    /// Submitted records the store accepted but did not write, e.g. edges
    /// whose endpoints are absent.
    pub fn skipped(&self) -> usize {
        self.submitted
            .saturating_sub(self.written)
            .saturating_sub(self.failed_records)
    }
}

/// Write counters of one phase across shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    pub shards: BTreeMap<ShardId, ShardCounts>,
}

impl PhaseCounts {
    pub fn total(&self) -> ShardCounts {
        let mut total = ShardCounts::default();
        for counts in self.shards.values() {
            total.merge(counts);
        }
        total
    }

    pub fn merge(&mut self, other: &PhaseCounts) {
        for (sid, counts) in &other.shards {
            self.shards.entry(*sid).or_default().merge(counts);
        }
    }
}

/// Error raised when the loader is built with the wrong stores.
#[derive(Debug, thiserror::Error)]
#[error("Store at position {position} holds shard {shard}")]
pub struct ShardOrderError {
    pub position: usize,
    pub shard: ShardId,
}

/// Writes per-shard batches to one store per shard.
pub struct ShardLoader<S: ShardStore> {
    stores: Vec<S>,
    config: LoaderConfig,
}

impl<S: ShardStore> ShardLoader<S> {
    /// Creates a loader. `stores[i]` must hold shard `i`.
    pub fn new(stores: Vec<S>, config: LoaderConfig) -> Result<Self, ShardOrderError> {
        if let Some((position, store)) = stores
            .iter()
            .enumerate()
            .find(|(i, store)| store.shard() as usize != *i)
        {
            return Err(ShardOrderError {
                position,
                shard: store.shard(),
            });
        }
        Ok(Self { stores, config })
    }

    pub fn shard_count(&self) -> usize {
        self.stores.len()
    }

    pub fn stores(&self) -> &[S] {
        &self.stores
    }

    pub fn into_stores(self) -> Vec<S> {
        self.stores
    }

    /// Writes node batches, one concurrent task per shard.
    pub fn write_nodes(
        &mut self,
        entity: EntityType,
        batches: BTreeMap<ShardId, Vec<NodeWrite>>,
    ) -> PhaseCounts {
        let config = self.config.clone();
        self.fan_out(batches, |store, items| {
            write_batches(store, &config, items, |store, chunk| store.upsert_nodes(entity, chunk))
        })
    }

    /// Writes edge batches, one concurrent task per shard.
    pub fn write_edges(
        &mut self,
        relation: RelationType,
        batches: BTreeMap<ShardId, Vec<EdgeWrite>>,
    ) -> PhaseCounts {
        let config = self.config.clone();
        self.fan_out(batches, |store, items| {
            write_batches(store, &config, items, |store, chunk| store.upsert_edges(relation, chunk))
        })
    }

    /// Creates the proxy node on every shard. Returns the shards that failed.
    pub fn ensure_proxy_nodes(&mut self) -> Vec<ShardId> {
        let config = &self.config;
        self.stores
            .par_iter_mut()
            .filter_map(|store| {
                let sid = store.shard();
                match with_retries(store, config, &mut 0, |store| store.ensure_proxy_node()) {
                    Ok(()) => None,
                    Err(e) => {
                        error!(shard = sid, error = %e, "Failed to create proxy node");
                        Some(sid)
                    }
                }
            })
            .collect()
    }

    fn fan_out<T, F>(&mut self, batches: BTreeMap<ShardId, Vec<T>>, write: F) -> PhaseCounts
    where
        T: Sync,
        F: Fn(&mut S, &[T]) -> ShardCounts + Sync,
    {
        let mut per_shard: Vec<Vec<T>> = (0..self.stores.len()).map(|_| Vec::new()).collect();
        let mut orphaned = BTreeMap::new();
        for (sid, items) in batches {
            match per_shard.get_mut(sid as usize) {
                Some(slot) => *slot = items,
                None if items.is_empty() => {}
                None => {
                    error!(shard = sid, records = items.len(), "No store for shard");
                    orphaned.insert(
                        sid,
                        ShardCounts {
                            submitted: items.len(),
                            failed_batches: 1,
                            failed_records: items.len(),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let mut shards: BTreeMap<ShardId, ShardCounts> = self
            .stores
            .par_iter_mut()
            .zip(per_shard.par_iter())
            .filter(|(_, items)| !items.is_empty())
            .map(|(store, items)| (store.shard(), write(store, items)))
            .collect();
        shards.extend(orphaned);
        PhaseCounts { shards }
    }
}

/// Splits `items` into batches and writes them, retrying each failed batch.
fn write_batches<S, T, F>(store: &mut S, config: &LoaderConfig, items: &[T], write: F) -> ShardCounts
where
    S: ShardStore,
    F: Fn(&mut S, &[T]) -> Result<usize, StoreError>,
{
    let mut counts = ShardCounts::default();
    for chunk in items.chunks(config.batch_size.max(1)) {
        counts.submitted += chunk.len();
        match with_retries(store, config, &mut counts.retries, |store| write(store, chunk)) {
            Ok(written) => {
                counts.written += written;
                debug!(shard = store.shard(), batch = chunk.len(), written, "Batch written");
            }
            Err(e) => {
                error!(shard = store.shard(), batch = chunk.len(), error = %e, "Giving up on batch");
                counts.failed_batches += 1;
                counts.failed_records += chunk.len();
            }
        }
    }
    counts
}

fn with_retries<S, R, F>(
    store: &mut S,
    config: &LoaderConfig,
    retries: &mut usize,
    mut op: F,
) -> Result<R, StoreError>
where
    S: ShardStore,
    F: FnMut(&mut S) -> Result<R, StoreError>,
{
    let mut attempt = 0;
    loop {
        match op(store) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries => {
                let delay = config.retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                warn!(shard = store.shard(), attempt = attempt + 1, delay_ms = delay, error = %e, "Retrying batch");
                thread::sleep(Duration::from_millis(delay));
                attempt += 1;
                *retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
