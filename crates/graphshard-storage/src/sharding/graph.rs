//! Partition-graph building.
//!
//! Turns a configured subset of relationship types into the undirected,
//! duplicate-free adjacency file consumed by the partitioner:
//!
//! ```text
//! 4 3          <- node_count edge_count
//! 2 3          <- neighbors of index 1
//! 1            <- neighbors of index 2
//! 1 4
//! 3
//! ```
//!
//! Only vids with at least one selected edge appear. They are numbered
//! 1..=n in ascending vid order, so unchanged input always yields the same
//! numbering and the same file.

use super::{PartitionError, Result};
use crate::dataset::{parse_row, relationship_endpoints, DatasetReader};
use crate::identity::VidMaps;
use graphshard_core::{RelationType, Vid};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the partitioner input.
pub const GRAPH_FILE: &str = "graph.txt";

/// File name of the index↔vid table.
pub const INDEX_FILE: &str = "vid_index_map.csv";

// =============================================================================
// Partition Graph
// =============================================================================

/// Undirected adjacency keyed by vid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionGraph {
    adjacency: BTreeMap<Vid, BTreeSet<Vid>>,
}

impl PartitionGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an undirected edge. Self-loops are rejected and return false.
    pub fn add_edge(&mut self, a: Vid, b: Vid) -> bool {
        if a == b {
            return false;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
        true
    }

    /// Number of vids with at least one edge.
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Number of undirected edges: half the sum of adjacency sizes.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Neighbors of `vid`, ascending.
    pub fn neighbors(&self, vid: Vid) -> impl Iterator<Item = Vid> + '_ {
        self.adjacency.get(&vid).into_iter().flatten().copied()
    }

    /// Vids in the graph, ascending.
    pub fn vids(&self) -> impl Iterator<Item = Vid> + '_ {
        self.adjacency.keys().copied()
    }

    /// Returns true if every neighbor relation is mirrored.
    pub fn is_symmetric(&self) -> bool {
        self.adjacency.iter().all(|(vid, neighbors)| {
            neighbors
                .iter()
                .all(|n| self.adjacency.get(n).is_some_and(|back| back.contains(vid)))
        })
    }

    /// Numbers the vids 1..=n in ascending order.
    pub fn index(&self) -> PartitionIndex {
        PartitionIndex::from_sorted(self.vids())
    }

    /// Writes the partitioner input using `index` for numbering.
    pub fn write_adjacency<W: Write>(&self, out: &mut W, index: &PartitionIndex) -> Result<()> {
        writeln!(out, "{} {}", self.node_count(), self.edge_count())?;
        for (vid, neighbors) in &self.adjacency {
            let mut line: Vec<u64> = neighbors
                .iter()
                .filter_map(|n| index.index_of(*n))
                .collect();
            line.sort_unstable();
            let line: Vec<String> = line.iter().map(u64::to_string).collect();
            if line.is_empty() {
                warn!(%vid, "Vid has no indexed neighbors");
            }
            writeln!(out, "{}", line.join(" "))?;
        }
        Ok(())
    }

    /// Writes the graph file and the index table into `dir`.
    pub fn write_outputs(&self, dir: &Path) -> Result<PartitionOutputs> {
        std::fs::create_dir_all(dir)?;
        let index = self.index();

        let graph_path = dir.join(GRAPH_FILE);
        let mut out = BufWriter::new(File::create(&graph_path)?);
        self.write_adjacency(&mut out, &index)?;
        out.flush()?;

        let index_path = dir.join(INDEX_FILE);
        index.write(&index_path)?;

        info!(
            nodes = self.node_count(),
            edges = self.edge_count(),
            graph = %graph_path.display(),
            index = %index_path.display(),
            "Wrote partition graph"
        );

        Ok(PartitionOutputs {
            graph_path,
            index_path,
            index,
        })
    }
}

/// Files produced by [`PartitionGraph::write_outputs`].
#[derive(Debug, Clone)]
pub struct PartitionOutputs {
    /// Partitioner input
    pub graph_path: PathBuf,
    /// Index↔vid table
    pub index_path: PathBuf,
    /// The index that was written
    pub index: PartitionIndex,
}

// =============================================================================
// Partition Index
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct IndexRow {
    vid: u64,
    index: u64,
}

/// Bidirectional table between 1-based partition indices and vids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionIndex {
    by_index: BTreeMap<u64, Vid>,
    by_vid: BTreeMap<Vid, u64>,
}

impl PartitionIndex {
    /// Numbers `vids` 1..=n in iteration order.
    pub fn from_sorted(vids: impl IntoIterator<Item = Vid>) -> Self {
        let mut index = Self::default();
        for (i, vid) in vids.into_iter().enumerate() {
            index.insert(i as u64 + 1, vid);
        }
        index
    }

    fn insert(&mut self, idx: u64, vid: Vid) {
        self.by_index.insert(idx, vid);
        self.by_vid.insert(vid, idx);
    }

    /// Vid at 1-based `idx`.
    pub fn vid_at(&self, idx: u64) -> Option<Vid> {
        self.by_index.get(&idx).copied()
    }

    /// 1-based index of `vid`.
    pub fn index_of(&self, vid: Vid) -> Option<u64> {
        self.by_vid.get(&vid).copied()
    }

    /// Number of indexed vids.
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Writes the table as `vid,index`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (&index, vid) in &self.by_index {
            writer.serialize(IndexRow { vid: vid.0, index })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads a `vid,index` table. Malformed rows are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PartitionError::MissingInput {
                what: "index map",
                path: path.to_path_buf(),
            });
        }

        let mut index = Self::default();
        let mut reader = csv::Reader::from_path(path)?;
        for row in reader.deserialize::<IndexRow>() {
            match row {
                Ok(row) => index.insert(row.index, Vid(row.vid)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed index row"),
            }
        }
        Ok(index)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Per-relationship counters of a graph build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationCounts {
    /// Records read
    pub records: u64,
    /// Records that produced an edge (possibly a duplicate)
    pub edges: u64,
    /// Records with missing or malformed endpoint ids
    pub unparseable: u64,
    /// Records whose endpoint had no vid
    pub unresolved: u64,
    /// Records connecting a vid to itself
    pub self_loops: u64,
}

impl RelationCounts {
    fn absorb(&mut self, other: &RelationCounts) {
        self.records += other.records;
        self.edges += other.edges;
        self.unparseable += other.unparseable;
        self.unresolved += other.unresolved;
        self.self_loops += other.self_loops;
    }
}

/// Counters of one partition-graph build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphReport {
    /// Counters per selected relationship
    pub relations: BTreeMap<RelationType, RelationCounts>,
    /// Vids in the graph
    pub nodes: usize,
    /// Undirected edges in the graph
    pub edges: usize,
    /// Vids known to the identity maps but absent from the graph
    pub isolated_vids: usize,
}

impl GraphReport {
    /// Sum of counters over every relationship.
    pub fn totals(&self) -> RelationCounts {
        let mut totals = RelationCounts::default();
        for counts in self.relations.values() {
            totals.absorb(counts);
        }
        totals
    }

    /// Logs the counters.
    pub fn log_summary(&self) {
        for (relation, counts) in &self.relations {
            info!(
                %relation,
                records = counts.records,
                edges = counts.edges,
                unparseable = counts.unparseable,
                unresolved = counts.unresolved,
                self_loops = counts.self_loops,
                "Partition relation summary"
            );
        }
        info!(nodes = self.nodes, edges = self.edges, "Partition graph built");
        if self.isolated_vids > 0 {
            warn!(
                isolated = self.isolated_vids,
                "Vids without any partitioning edge will not receive a shard"
            );
        }
    }
}

/// Builds a [`PartitionGraph`] from relationship files.
pub struct PartitionGraphBuilder<'a> {
    reader: &'a DatasetReader,
    maps: &'a VidMaps,
}

impl<'a> PartitionGraphBuilder<'a> {
    /// Creates a builder resolving endpoints through `maps`.
    pub fn new(reader: &'a DatasetReader, maps: &'a VidMaps) -> Self {
        Self { reader, maps }
    }

    /// Reads one relationship file into resolved vid pairs.
    fn read_relation(&self, relation: RelationType) -> Result<(Vec<(Vid, Vid)>, RelationCounts)> {
        let from_map = self.maps.get(relation.from_type());
        let to_map = self.maps.get(relation.to_type());
        let rows = self.reader.relation_rows(relation)?;
        info!(%relation, path = %rows.path().display(), "Reading partition edges");

        let mut counts = RelationCounts::default();
        let mut pairs = Vec::new();

        for row in rows {
            counts.records += 1;
            let (from, to) = match parse_row(row, relationship_endpoints) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(%relation, line = e.line, error = %e.error, "Skipping unparseable relationship record");
                    counts.unparseable += 1;
                    continue;
                }
            };

            match (from_map.get(from), to_map.get(to)) {
                (Some(a), Some(b)) if a == b => counts.self_loops += 1,
                (Some(a), Some(b)) => {
                    pairs.push((a, b));
                    counts.edges += 1;
                }
                _ => {
                    warn!(%relation, from, to, "Missing vid for relationship endpoint");
                    counts.unresolved += 1;
                }
            }
        }

        Ok((pairs, counts))
    }

    /// Builds the graph from `relations`.
    ///
    /// Relationship files are read in parallel and merged in configuration
    /// order. A missing file is fatal; bad records are counted.
    pub fn build(&self, relations: &[RelationType]) -> Result<(PartitionGraph, GraphReport)> {
        let parts: Vec<_> = relations
            .par_iter()
            .map(|&relation| self.read_relation(relation).map(|part| (relation, part)))
            .collect::<Result<_>>()?;

        let mut graph = PartitionGraph::new();
        let mut report = GraphReport::default();
        for (relation, (pairs, counts)) in parts {
            for (a, b) in pairs {
                graph.add_edge(a, b);
            }
            report.relations.entry(relation).or_default().absorb(&counts);
        }

        report.nodes = graph.node_count();
        report.edges = graph.edge_count();
        report.isolated_vids = self.maps.total().saturating_sub(report.nodes);
        Ok((graph, report))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityVirtualizer;
    use graphshard_core::EntityType;
    use std::fs;
    use tempfile::TempDir;

    fn graph_of(edges: &[(u64, u64)]) -> PartitionGraph {
        let mut graph = PartitionGraph::new();
        for &(a, b) in edges {
            graph.add_edge(Vid(a), Vid(b));
        }
        graph
    }

    fn render(graph: &PartitionGraph) -> String {
        let mut out = Vec::new();
        graph.write_adjacency(&mut out, &graph.index()).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_adjacency_is_symmetric_and_deduplicated() {
        let graph = graph_of(&[(10, 20), (20, 10), (10, 20), (20, 30)]);

        assert!(graph.is_symmetric());
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.neighbors(Vid(20)).collect::<Vec<_>>(), vec![Vid(10), Vid(30)]);
    }

    #[test]
    fn test_self_loops_are_rejected() {
        let mut graph = PartitionGraph::new();
        assert!(!graph.add_edge(Vid(4), Vid(4)));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_adjacency_file_format() {
        // vids 5, 7, 9, 12 -> indices 1..4
        let graph = graph_of(&[(5, 7), (5, 9), (9, 12)]);
        assert_eq!(render(&graph), "4 3\n2 3\n1\n1 4\n3\n");
    }

    #[test]
    fn test_header_edge_count_is_half_of_neighbor_lists() {
        let graph = graph_of(&[(1, 2), (1, 3), (2, 3), (3, 4), (4, 5), (5, 1)]);
        let text = render(&graph);
        let mut lines = text.lines();
        let header: Vec<usize> = lines
            .next()
            .unwrap()
            .split(' ')
            .map(|s| s.parse().unwrap())
            .collect();
        let listed: usize = lines.map(|l| l.split_whitespace().count()).sum();

        assert_eq!(header[0], 5);
        assert_eq!(header[1] * 2, listed);
    }

    #[test]
    fn test_index_is_deterministic() {
        let a = graph_of(&[(30, 10), (20, 10)]);
        let b = graph_of(&[(10, 20), (10, 30)]);

        assert_eq!(a.index(), b.index());
        assert_eq!(render(&a), render(&b));
        assert_eq!(a.index().vid_at(1), Some(Vid(10)));
        assert_eq!(a.index().index_of(Vid(30)), Some(3));
    }

    #[test]
    fn test_index_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let graph = graph_of(&[(3, 8), (8, 11)]);
        let outputs = graph.write_outputs(dir.path()).unwrap();

        let loaded = PartitionIndex::load(&outputs.index_path).unwrap();
        assert_eq!(loaded, outputs.index);
        assert_eq!(
            fs::read_to_string(&outputs.index_path).unwrap(),
            "vid,index\n3,1\n8,2\n11,3\n"
        );
    }

    #[test]
    fn test_builder_counts_unresolved_and_isolated() {
        let dir = TempDir::new().unwrap();
        let area = dir.path().join("static");
        fs::create_dir_all(&area).unwrap();
        fs::write(
            area.join("organisation_isLocatedIn_place_0_0.csv"),
            "Organisation.id|Place.id\n1|100\n2|100\n3|999\nbad|100\n",
        )
        .unwrap();

        let mut virt = IdentityVirtualizer::new();
        for org in [1, 2, 3, 4] {
            virt.assign(EntityType::Organisation, org);
        }
        virt.assign(EntityType::Place, 100);

        let reader = DatasetReader::new(dir.path());
        let (graph, report) = PartitionGraphBuilder::new(&reader, virt.maps())
            .build(&[RelationType::OrganisationIsLocatedInPlace])
            .unwrap();

        let counts = &report.relations[&RelationType::OrganisationIsLocatedInPlace];
        assert_eq!(counts.records, 4);
        assert_eq!(counts.edges, 2);
        assert_eq!(counts.unresolved, 1);
        assert_eq!(counts.unparseable, 1);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(report.isolated_vids, 2);
    }

    #[test]
    fn test_builder_missing_relation_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let reader = DatasetReader::new(dir.path());
        let maps = VidMaps::new();

        let result = PartitionGraphBuilder::new(&reader, &maps).build(&[RelationType::ForumHasTagTag]);
        assert!(matches!(result, Err(PartitionError::Dataset(_))));
    }
}
