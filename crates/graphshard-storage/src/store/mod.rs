//! Shard store contract.
//!
//! A shard store is one independent graph database instance. Writes are
//! idempotent upserts: nodes merge by `(label, vid)`, direct edges by
//! `(from, to, type)` and proxy edges by `(from, target_vid, type)`. An edge
//! whose endpoints are not present on the shard is a no-op.

mod memory;
mod neo4j;

pub use memory::MemoryShardStore;
pub use neo4j::{Neo4jAuth, Neo4jShardStore};

use crate::config::{GraphshardConfig, StoreBackend};
use graphshard_core::{Attributes, EntityType, PropertyValue, RelationType, ShardId, Vid};
use std::time::Duration;
use thiserror::Error;

/// Label of the per-shard placeholder node that proxy edges point at.
pub const PROXY_LABEL: &str = "ProxyUniversal";

/// Attribute marking an edge as a proxy edge.
pub const PROXY_FLAG: &str = "proxy";

/// Attribute holding the vid of a proxy edge's real endpoint.
pub const TARGET_VID: &str = "target_vid";

/// Attribute holding the shard of a proxy edge's real endpoint.
pub const TARGET_SID: &str = "target_sid";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by shard stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shard {shard} rejected statement: {code}: {message}")]
    Rejected {
        shard: ShardId,
        code: String,
        message: String,
    },

    #[error("Shard {shard} unavailable: {reason}")]
    Unavailable { shard: ShardId, reason: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Write Records
// =============================================================================

/// A node upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeWrite {
    pub vid: Vid,
    pub attributes: Attributes,
}

impl NodeWrite {
    pub fn new(vid: Vid, attributes: Attributes) -> Self {
        Self { vid, attributes }
    }
}

/// Destination of an edge on its source shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeTarget {
    /// A node on the same shard.
    Node(Vid),
    /// The shard's proxy node, standing in for a node on another shard.
    Proxy { target_vid: Vid, target_sid: ShardId },
}

/// An edge upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeWrite {
    pub from: Vid,
    pub target: EdgeTarget,
    pub attributes: Attributes,
}

impl EdgeWrite {
    /// An edge between two nodes of the same shard.
    pub fn direct(from: Vid, to: Vid, attributes: Attributes) -> Self {
        Self {
            from,
            target: EdgeTarget::Node(to),
            attributes,
        }
    }

    /// An edge from `from` to the proxy node, tagged with the real endpoint.
    pub fn proxied(from: Vid, target_vid: Vid, target_sid: ShardId, mut attributes: Attributes) -> Self {
        attributes.insert(PROXY_FLAG.to_string(), PropertyValue::Bool(true));
        attributes.insert(TARGET_VID.to_string(), PropertyValue::from(target_vid.0));
        attributes.insert(TARGET_SID.to_string(), PropertyValue::from(target_sid));
        Self {
            from,
            target: EdgeTarget::Proxy {
                target_vid,
                target_sid,
            },
            attributes,
        }
    }

    #[inline]
    pub fn is_proxy(&self) -> bool {
        matches!(self.target, EdgeTarget::Proxy { .. })
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// One shard's graph database.
///
/// Batch methods return how many records were written; edges whose endpoints
/// do not match are silently skipped and not counted.
pub trait ShardStore: Send {
    /// Shard this store holds.
    fn shard(&self) -> ShardId;

    /// Creates the proxy node if it does not exist yet.
    fn ensure_proxy_node(&mut self) -> Result<()>;

    /// Upserts a batch of nodes of one entity type.
    fn upsert_nodes(&mut self, entity: EntityType, batch: &[NodeWrite]) -> Result<usize>;

    /// Upserts a batch of edges of one relationship type.
    fn upsert_edges(&mut self, relation: RelationType, batch: &[EdgeWrite]) -> Result<usize>;

    fn upsert_node(&mut self, entity: EntityType, node: &NodeWrite) -> Result<usize> {
        self.upsert_nodes(entity, std::slice::from_ref(node))
    }

    fn upsert_edge(&mut self, relation: RelationType, edge: &EdgeWrite) -> Result<usize> {
        self.upsert_edges(relation, std::slice::from_ref(edge))
    }
}

impl<S: ShardStore + ?Sized> ShardStore for Box<S> {
    fn shard(&self) -> ShardId {
        (**self).shard()
    }

    fn ensure_proxy_node(&mut self) -> Result<()> {
        (**self).ensure_proxy_node()
    }

    fn upsert_nodes(&mut self, entity: EntityType, batch: &[NodeWrite]) -> Result<usize> {
        (**self).upsert_nodes(entity, batch)
    }

    fn upsert_edges(&mut self, relation: RelationType, batch: &[EdgeWrite]) -> Result<usize> {
        (**self).upsert_edges(relation, batch)
    }
}

/// Opens one store per shard, ordered by shard id.
///
/// The configuration must already be validated so that every shard has
/// exactly one endpoint.
pub fn open_shard_stores(config: &GraphshardConfig) -> Result<Vec<Box<dyn ShardStore>>> {
    let shard_count = config.partition.shard_count;
    match config.loader.backend {
        StoreBackend::Memory => Ok((0..shard_count)
            .map(|sid| Box::new(MemoryShardStore::new(sid)) as Box<dyn ShardStore>)
            .collect()),
        StoreBackend::Neo4j => {
            let shards = &config.shards;
            let auth = match (&shards.username, &shards.password) {
                (Some(username), Some(password)) => Some(Neo4jAuth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            };
            let mut endpoints: Vec<_> = shards
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.sid < shard_count)
                .collect();
            endpoints.sort_by_key(|endpoint| endpoint.sid);

            endpoints
                .into_iter()
                .map(|endpoint| {
                    let store = Neo4jShardStore::new(
                        endpoint.sid,
                        &endpoint.address,
                        &shards.database,
                        auth.clone(),
                        Duration::from_secs(shards.timeout_secs),
                    )?;
                    Ok(Box::new(store) as Box<dyn ShardStore>)
                })
                .collect()
        }
    }
}

// =============================================================================
// JSON Conversion
// =============================================================================

/// Converts a property value into its JSON form.
pub fn property_json(value: &PropertyValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        PropertyValue::Null => Value::Null,
        PropertyValue::Bool(b) => Value::Bool(*b),
        PropertyValue::Int(i) => Value::from(*i),
        PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        PropertyValue::String(s) | PropertyValue::Date(s) | PropertyValue::DateTime(s) => {
            Value::String(s.clone())
        }
    }
}

/// Converts an attribute bag into a JSON object, dropping nulls.
pub fn attributes_json(attributes: &Attributes) -> serde_json::Value {
    let map = attributes
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.clone(), property_json(value)))
        .collect();
    serde_json::Value::Object(map)
}
