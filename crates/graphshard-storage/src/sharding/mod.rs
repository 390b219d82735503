//! Graph sharding driven by an external partitioner.
//!
//! ```text
//!   VID maps ──► PartitionGraphBuilder ──► graph.txt ──► Partitioner
//!                        │                                   │
//!                        ▼                                   ▼
//!               vid_index_map.csv ─────────────► resolve_assignment
//!                                                            │
//!                                                            ▼
//!                                                    vid_sid_log.csv
//!                                                            │
//!                                                            ▼
//!   node / relationship records ──────────────────────► ShardRouter
//!                                                  ┌─────────┼──────────┐
//!                                                  ▼         ▼          ▼
//!                                               Shard 0   Shard 1 … Shard N
//! ```
//!
//! A relationship whose endpoints land on different shards is written only on
//! the source shard, as an edge to that shard's proxy node carrying the remote
//! vid and shard. The pair is also recorded in a cross-shard side table.

mod assignment;
mod graph;
mod ledger;
mod partitioner;
mod router;

pub use assignment::{resolve_assignment, ResolveReport, ShardAssignment, ASSIGNMENT_FILE};
pub use graph::{
    GraphReport, PartitionGraph, PartitionGraphBuilder, PartitionIndex, PartitionOutputs,
    RelationCounts, GRAPH_FILE, INDEX_FILE,
};
pub use ledger::{CrossShardEdge, CrossShardLedger, UnroutableLog, UNROUTABLE_FILE};
pub use partitioner::{MetisPartitioner, Partitioner};
pub use router::{EdgePlan, EdgeRecord, EdgeRoute, NodePlan, NodeRecord, ShardRouter};

use crate::dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building, partitioning or resolving the partition graph.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Required {what} not found at {}", path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    #[error("Partitioner {program} failed ({status}): {stderr}")]
    Partitioner {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Malformed row in {}: {reason}", path.display())]
    MalformedRow { path: PathBuf, reason: String },

    #[error("Invalid shard count: {0}")]
    InvalidShardCount(u32),
}

/// Result type for sharding operations.
pub type Result<T> = std::result::Result<T, PartitionError>;
