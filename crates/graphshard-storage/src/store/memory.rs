//! In-process shard store.
//!
//! Applies the same merge rules as a database-backed shard and keeps the
//! result in ordered maps. Used for dry runs and tests.

use super::{EdgeTarget, EdgeWrite, NodeWrite, Result, ShardStore, StoreError};
use graphshard_core::{Attributes, EntityType, RelationType, ShardId, Vid};
use std::collections::BTreeMap;

/// Merge key of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EdgeKey {
    relation: RelationType,
    from: Vid,
    target: EdgeEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EdgeEndpoint {
    Node(Vid),
    Proxy(Vid),
}

impl From<EdgeTarget> for EdgeEndpoint {
    fn from(target: EdgeTarget) -> Self {
        match target {
            EdgeTarget::Node(vid) => EdgeEndpoint::Node(vid),
            EdgeTarget::Proxy { target_vid, .. } => EdgeEndpoint::Proxy(target_vid),
        }
    }
}

/// A shard held in memory.
#[derive(Debug, Default)]
pub struct MemoryShardStore {
    shard: ShardId,
    nodes: BTreeMap<(EntityType, Vid), Attributes>,
    edges: BTreeMap<EdgeKey, Attributes>,
    proxy_node: bool,
    failures_left: usize,
    calls: usize,
}

impl MemoryShardStore {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            ..Default::default()
        }
    }

    /// Makes the next `count` write calls fail as if the shard were down.
    pub fn fail_next(&mut self, count: usize) {
        self.failures_left = count;
    }

    /// Number of write calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn node(&self, entity: EntityType, vid: Vid) -> Option<&Attributes> {
        self.nodes.get(&(entity, vid))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_proxy_node(&self) -> bool {
        self.proxy_node
    }

    /// Attributes of the direct edge `from -[relation]-> to`.
    pub fn edge(&self, relation: RelationType, from: Vid, to: Vid) -> Option<&Attributes> {
        self.edges.get(&EdgeKey {
            relation,
            from,
            target: EdgeEndpoint::Node(to),
        })
    }

    /// Attributes of the proxy edge from `from` standing in for `target_vid`.
    pub fn proxy_edge(&self, relation: RelationType, from: Vid, target_vid: Vid) -> Option<&Attributes> {
        self.edges.get(&EdgeKey {
            relation,
            from,
            target: EdgeEndpoint::Proxy(target_vid),
        })
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn proxy_edge_count(&self) -> usize {
        self.edges
            .keys()
            .filter(|key| matches!(key.target, EdgeEndpoint::Proxy(_)))
            .count()
    }

    fn check_available(&mut self) -> Result<()> {
        self.calls += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(StoreError::Unavailable {
                shard: self.shard,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn endpoint_exists(&self, relation: RelationType, edge: &EdgeWrite) -> bool {
        if !self.nodes.contains_key(&(relation.from_type(), edge.from)) {
            return false;
        }
        match edge.target {
            EdgeTarget::Node(to) => self.nodes.contains_key(&(relation.to_type(), to)),
            EdgeTarget::Proxy { .. } => self.proxy_node,
        }
    }
}

impl ShardStore for MemoryShardStore {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn ensure_proxy_node(&mut self) -> Result<()> {
        self.check_available()?;
        self.proxy_node = true;
        Ok(())
    }

    fn upsert_nodes(&mut self, entity: EntityType, batch: &[NodeWrite]) -> Result<usize> {
        self.check_available()?;
        for node in batch {
            self.nodes
                .entry((entity, node.vid))
                .or_default()
                .extend(node.attributes.clone());
        }
        Ok(batch.len())
    }

    fn upsert_edges(&mut self, relation: RelationType, batch: &[EdgeWrite]) -> Result<usize> {
        self.check_available()?;
        let mut written = 0;
        for edge in batch {
            if !self.endpoint_exists(relation, edge) {
                continue;
            }
            let key = EdgeKey {
                relation,
                from: edge.from,
                target: edge.target.into(),
            };
            self.edges.entry(key).or_default().extend(edge.attributes.clone());
            written += 1;
        }
        Ok(written)
    }
}
