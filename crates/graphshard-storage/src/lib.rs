//! Sharding pipeline for property-graph datasets.
//!
//! Splits a delimited social-network dataset across independent graph
//! database instances:
//!
//! - [`identity`]: global vids for every `(entity type, raw id)` pair
//! - [`sharding`]: partition graph, external partitioner, shard assignment,
//!   record routing and cross-shard side tables
//! - [`store`]: the per-shard database contract with Neo4j and in-memory
//!   implementations
//! - [`loader`]: concurrent batched writes with retries
//! - [`pipeline`]: the stages wired to the configuration

pub mod config;
pub mod dataset;
pub mod identity;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod sharding;
pub mod store;

// Re-exports
pub use config::{ConfigError, GraphshardConfig, StoreBackend};
pub use dataset::{DatasetError, DatasetReader};
pub use identity::{IdentityReport, IdentityVirtualizer, VidMaps};
pub use loader::{PhaseCounts, ShardCounts, ShardLoader};
pub use pipeline::{LoadReport, Pipeline, PipelineError, PipelineReport};
pub use sharding::{MetisPartitioner, Partitioner, ShardAssignment, ShardRouter};
pub use store::{open_shard_stores, MemoryShardStore, Neo4jShardStore, ShardStore, StoreError};
