//! End-to-end sharding pipeline.
//!
//! Stages, each resumable from the persisted state of the previous one:
//!
//! 1. `assign_vids`: node files → vid maps + counter
//! 2. `build_graph`: relationship files + vid maps → `graph.txt` + index map
//! 3. `partition`: external partitioner → `graph.txt.part.N`
//! 4. `resolve`: partition file + index map → `vid_sid_log.csv`
//! 5. `load_nodes`: node files → shard stores, then proxy nodes
//! 6. `load_relationships`: relationship files → shard stores + side tables

use crate::config::{ConfigError, GraphshardConfig};
use crate::dataset::{parse_node, parse_relationship, parse_row, DatasetError, DatasetReader};
use crate::identity::{IdentityError, IdentityReport, IdentityVirtualizer, VidMaps};
use crate::loader::{PhaseCounts, ShardLoader, ShardOrderError};
use crate::sharding::{
    resolve_assignment, CrossShardLedger, EdgeRecord, GraphReport, MetisPartitioner, NodeRecord,
    PartitionError, PartitionGraphBuilder, PartitionIndex, PartitionOutputs, Partitioner,
    ResolveReport, ShardAssignment, ShardRouter, UnroutableLog, ASSIGNMENT_FILE, GRAPH_FILE,
    INDEX_FILE,
};
use crate::store::{ShardStore, StoreError};
use graphshard_core::{EntityType, RelationType, ShardId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort a pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ShardOrder(#[from] ShardOrderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline stages.
pub type Result<T> = std::result::Result<T, PipelineError>;

// =============================================================================
// Reports
// =============================================================================

/// Counters of one loading stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Records read from the dataset
    pub records: usize,
    /// Records skipped because they did not parse
    pub unparseable: usize,
    /// Records skipped because a raw id has no vid
    pub unresolved: usize,
    /// Records skipped because a vid has no shard
    pub unroutable: usize,
    /// Assignment rows rejected on load
    pub invalid_assignments: usize,
    /// Relationships written as direct edges
    pub direct_edges: usize,
    /// Relationships written as proxy edges
    pub proxy_edges: usize,
    /// Per-shard write counters
    pub writes: PhaseCounts,
    /// Shards where the proxy node could not be created
    pub proxy_node_failures: Vec<ShardId>,
}

impl LoadReport {
    pub fn merge(&mut self, other: &LoadReport) {
        self.records += other.records;
        self.unparseable += other.unparseable;
        self.unresolved += other.unresolved;
        self.unroutable += other.unroutable;
        self.invalid_assignments += other.invalid_assignments;
        self.direct_edges += other.direct_edges;
        self.proxy_edges += other.proxy_edges;
        self.writes.merge(&other.writes);
        self.proxy_node_failures.extend(&other.proxy_node_failures);
    }

    /// Logs the counters.
    pub fn log_summary(&self, stage: &str) {
        let total = self.writes.total();
        info!(
            stage,
            records = self.records,
            written = total.written,
            skipped_by_store = total.skipped(),
            unparseable = self.unparseable,
            unresolved = self.unresolved,
            unroutable = self.unroutable,
            invalid_assignments = self.invalid_assignments,
            direct_edges = self.direct_edges,
            proxy_edges = self.proxy_edges,
            "Load finished"
        );
        for (sid, counts) in &self.writes.shards {
            info!(stage, shard = sid, written = counts.written, retries = counts.retries, "Shard totals");
        }
        if total.failed_batches > 0 {
            warn!(
                stage,
                failed_batches = total.failed_batches,
                failed_records = total.failed_records,
                "Some batches were given up"
            );
        }
    }
}

/// Counters of a full run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub identity: IdentityReport,
    pub graph: GraphReport,
    pub resolve: ResolveReport,
    pub nodes: LoadReport,
    pub relationships: LoadReport,
}

impl PipelineReport {
    pub fn log_summary(&self) {
        self.identity.log_summary();
        self.graph.log_summary();
        self.resolve.log_summary();
        self.nodes.log_summary("nodes");
        self.relationships.log_summary("relationships");
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs the sharding stages against a validated configuration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: GraphshardConfig,
    reader: DatasetReader,
}

impl Pipeline {
    /// Creates a pipeline. The configuration is validated first.
    pub fn new(config: GraphshardConfig) -> Result<Self> {
        config.validate()?;
        let reader = config.dataset_reader();
        Ok(Self { config, reader })
    }

    pub fn config(&self) -> &GraphshardConfig {
        &self.config
    }

    fn state_dir(&self) -> Result<PathBuf> {
        let dir = self.config.state.dir();
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn graph_dir(&self) -> Result<PathBuf> {
        let dir = self.config.state.graph_dir();
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Path of the partitioner output for the configured shard count.
    pub fn partition_file(&self) -> PathBuf {
        MetisPartitioner::output_path(
            &self.config.state.graph_dir().join(GRAPH_FILE),
            self.config.partition.shard_count,
        )
    }

    /// Stage 1: assigns a vid to every node record and persists the maps.
    pub fn assign_vids(&self) -> Result<IdentityReport> {
        let state_dir = self.state_dir()?;
        let mut virtualizer = IdentityVirtualizer::open(&state_dir)?;
        let report = virtualizer.scan(&self.reader, &self.config.dataset.entities)?;
        virtualizer.persist(&state_dir)?;
        report.log_summary();
        Ok(report)
    }

    /// Stage 2: builds and writes the partition graph and its index map.
    pub fn build_graph(&self) -> Result<(PartitionOutputs, GraphReport)> {
        let relations = &self.config.partition.relations;
        let maps = VidMaps::load_required(&self.state_dir()?, &endpoint_types(relations))?;

        let (graph, report) = PartitionGraphBuilder::new(&self.reader, &maps).build(relations)?;
        let outputs = graph.write_outputs(&self.graph_dir()?)?;
        report.log_summary();
        Ok((outputs, report))
    }

    /// Stage 3: runs the partitioner over the written graph.
    pub fn partition(&self, partitioner: &dyn Partitioner) -> Result<PathBuf> {
        let graph_file = self.graph_dir()?.join(GRAPH_FILE);
        info!(partitioner = %partitioner.describe(), "Partitioning");
        Ok(partitioner.partition(&graph_file, self.config.partition.shard_count)?)
    }

    /// Stage 4: joins the partitioner output with the index map and persists
    /// the assignment. Defaults to the partitioner's usual output path.
    pub fn resolve(&self, partition_file: Option<&Path>) -> Result<ResolveReport> {
        let default_file = self.partition_file();
        let partition_file = partition_file.unwrap_or(&default_file);
        let index = PartitionIndex::load(&self.graph_dir()?.join(INDEX_FILE))?;

        let (assignment, report) =
            resolve_assignment(partition_file, &index, self.config.partition.shard_count)?;
        assignment.write(&self.state_dir()?.join(ASSIGNMENT_FILE))?;
        report.log_summary();
        for (sid, size) in assignment.shard_sizes() {
            info!(shard = sid, vids = size, "Shard size");
        }
        Ok(report)
    }

    fn load_assignment(&self) -> Result<(ShardAssignment, usize)> {
        let path = self.state_dir()?.join(ASSIGNMENT_FILE);
        Ok(ShardAssignment::load(&path, self.config.partition.shard_count)?)
    }

    /// Loads the unroutable log, dropping vids that now have a shard.
    fn load_unroutable(
        &self,
        state_dir: &Path,
        assignment: &ShardAssignment,
    ) -> Result<UnroutableLog> {
        let mut log = UnroutableLog::load(state_dir)?;
        let placed = log.retain_unassigned(assignment);
        if placed > 0 {
            info!(vids = placed, "Previously unroutable vids now have a shard");
            log.write(state_dir)?;
        }
        Ok(log)
    }

    /// Stage 5: writes every node to its shard, then the proxy node of every
    /// shard.
    pub fn load_nodes<S: ShardStore>(&self, loader: &mut ShardLoader<S>) -> Result<LoadReport> {
        let state_dir = self.state_dir()?;
        let entities = &self.config.dataset.entities;
        let maps = VidMaps::load_required(&state_dir, entities)?;
        let (assignment, invalid_assignments) = self.load_assignment()?;
        let router = ShardRouter::new(&assignment);
        let mut unroutable = self.load_unroutable(&state_dir, &assignment)?;
        let mut report = LoadReport {
            invalid_assignments,
            ..Default::default()
        };

        for &entity in entities {
            let map = maps.get(entity);
            let rows = self.reader.entity_rows(entity)?;
            info!(%entity, path = %rows.path().display(), "Loading nodes");

            let mut records = Vec::new();
            for row in rows {
                report.records += 1;
                let (raw_id, attributes) = match parse_row(row, |row| parse_node(entity, row)) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(%entity, line = e.line, error = %e.error, "Skipping unparseable node record");
                        report.unparseable += 1;
                        continue;
                    }
                };
                match map.get(raw_id) {
                    Some(vid) => records.push(NodeRecord { vid, attributes }),
                    None => {
                        warn!(%entity, raw_id, "Node has no vid, run assign-vids first");
                        report.unresolved += 1;
                    }
                }
            }

            let plan = router.plan_nodes(entity, records);
            for &vid in &plan.unroutable {
                warn!(%entity, %vid, "Node has no shard, skipping");
                unroutable.record(vid, entity);
            }
            report.unroutable += plan.unroutable.len();
            report.writes.merge(&loader.write_nodes(entity, plan.batches));
        }

        report.proxy_node_failures = loader.ensure_proxy_nodes();
        if !unroutable.is_empty() {
            let path = unroutable.write(&state_dir)?;
            warn!(vids = unroutable.len(), path = %path.display(), "Exported unroutable vids");
        }
        report.log_summary("nodes");
        Ok(report)
    }

    /// Stage 6: writes `relations` to their source shards. Nodes must already
    /// be loaded.
    pub fn load_relationships<S: ShardStore>(
        &self,
        loader: &mut ShardLoader<S>,
        relations: &[RelationType],
    ) -> Result<LoadReport> {
        let state_dir = self.state_dir()?;
        let maps = VidMaps::load_required(&state_dir, &endpoint_types(relations))?;
        let (assignment, invalid_assignments) = self.load_assignment()?;
        let router = ShardRouter::new(&assignment);
        let mut unroutable = self.load_unroutable(&state_dir, &assignment)?;
        let mut report = LoadReport {
            invalid_assignments,
            ..Default::default()
        };

        for &relation in relations {
            let from_map = maps.get(relation.from_type());
            let to_map = maps.get(relation.to_type());
            let rows = self.reader.relation_rows(relation)?;
            info!(%relation, path = %rows.path().display(), "Loading relationships");

            let mut records = Vec::new();
            for row in rows {
                report.records += 1;
                let (from, to, attributes) =
                    match parse_row(row, |row| parse_relationship(relation, row)) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(
                                %relation,
                                line = e.line,
                                error = %e.error,
                                "Skipping unparseable relationship record"
                            );
                            report.unparseable += 1;
                            continue;
                        }
                    };
                match (from_map.get(from), to_map.get(to)) {
                    (Some(from), Some(to)) => records.push(EdgeRecord { from, to, attributes }),
                    _ => {
                        warn!(%relation, from, to, "Missing vid for relationship endpoint");
                        report.unresolved += 1;
                    }
                }
            }

            let plan = router.plan_relationships(relation, records);
            for &(vid, entity) in &plan.unroutable {
                warn!(%relation, %vid, "Relationship endpoint has no shard, skipping");
                unroutable.record(vid, entity);
            }
            report.unroutable += plan.skipped;
            report.direct_edges += plan.direct;
            report.proxy_edges += plan.proxied;

            if !plan.cross.is_empty() {
                let mut ledger = CrossShardLedger::load(&state_dir, relation)?;
                for edge in plan.cross {
                    ledger.record(edge);
                }
                let path = ledger.write(&state_dir)?;
                info!(%relation, entries = ledger.len(), path = %path.display(), "Cross-shard table written");
            }
            report.writes.merge(&loader.write_edges(relation, plan.batches));
        }

        if !unroutable.is_empty() {
            unroutable.write(&state_dir)?;
        }
        report.log_summary("relationships");
        Ok(report)
    }

    /// Runs every stage in order.
    pub fn run<S: ShardStore>(
        &self,
        partitioner: &dyn Partitioner,
        loader: &mut ShardLoader<S>,
    ) -> Result<PipelineReport> {
        let identity = self.assign_vids()?;
        let (_, graph) = self.build_graph()?;
        let partition_file = self.partition(partitioner)?;
        let resolve = self.resolve(Some(&partition_file))?;
        let nodes = self.load_nodes(loader)?;
        let relationships = self.load_relationships(loader, &self.config.dataset.relations)?;

        Ok(PipelineReport {
            identity,
            graph,
            resolve,
            nodes,
            relationships,
        })
    }
}

/// Entity types at either end of `relations`, in a stable order.
fn endpoint_types(relations: &[RelationType]) -> Vec<EntityType> {
    relations
        .iter()
        .flat_map(|r| [r.from_type(), r.to_type()])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
