//! Shard assignment resolution.
//!
//! Joins the partitioner output back to vids. Line `i` (1-based, blank lines
//! ignored) of the partition file holds the shard of partition index `i`.

use super::graph::PartitionIndex;
use super::{PartitionError, Result};
use graphshard_core::{ShardId, Vid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

/// File name of the persisted vid → sid table.
pub const ASSIGNMENT_FILE: &str = "vid_sid_log.csv";

#[derive(Debug, Serialize, Deserialize)]
struct AssignmentRow {
    vid: u64,
    sid: ShardId,
}

/// The durable vid → sid table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardAssignment {
    by_vid: HashMap<Vid, ShardId>,
}

impl ShardAssignment {
    /// Creates an empty assignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the shard of `vid`.
    pub fn insert(&mut self, vid: Vid, sid: ShardId) {
        self.by_vid.insert(vid, sid);
    }

    /// Shard of `vid`, if it has one.
    #[inline]
    pub fn get(&self, vid: Vid) -> Option<ShardId> {
        self.by_vid.get(&vid).copied()
    }

    /// Number of assigned vids.
    pub fn len(&self) -> usize {
        self.by_vid.len()
    }

    /// Returns true if no vid is assigned.
    pub fn is_empty(&self) -> bool {
        self.by_vid.is_empty()
    }

    /// Number of vids per shard.
    pub fn shard_sizes(&self) -> BTreeMap<ShardId, usize> {
        let mut sizes = BTreeMap::new();
        for sid in self.by_vid.values() {
            *sizes.entry(*sid).or_insert(0) += 1;
        }
        sizes
    }

    /// Writes the table as `vid,sid`, ascending by vid.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut rows: Vec<_> = self.by_vid.iter().map(|(v, s)| (*v, *s)).collect();
        rows.sort_unstable();

        let mut writer = csv::Writer::from_path(path)?;
        for (vid, sid) in rows {
            writer.serialize(AssignmentRow { vid: vid.0, sid })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads a `vid,sid` table. A missing file is fatal.
    ///
    /// Rows that do not parse or name a shard outside `[0, shard_count)` are
    /// skipped and their number is returned next to the table, so the vids
    /// they held surface as unroutable instead of targeting a missing shard.
    pub fn load(path: &Path, shard_count: u32) -> Result<(Self, usize)> {
        if !path.is_file() {
            return Err(PartitionError::MissingInput {
                what: "shard assignment",
                path: path.to_path_buf(),
            });
        }

        let mut assignment = Self::new();
        let mut invalid = 0;
        let mut reader = csv::Reader::from_path(path)?;
        for row in reader.deserialize::<AssignmentRow>() {
            match row {
                Ok(row) if row.sid < shard_count => assignment.insert(Vid(row.vid), row.sid),
                Ok(row) => {
                    warn!(
                        vid = row.vid,
                        sid = row.sid,
                        shard_count,
                        "Assigned shard out of range, table may be from another shard count"
                    );
                    invalid += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed assignment row");
                    invalid += 1;
                }
            }
        }
        info!(assigned = assignment.len(), invalid, "Loaded shard assignment");
        Ok((assignment, invalid))
    }
}

/// Counters of one resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Non-blank lines in the partition file
    pub lines: usize,
    /// Entries in the index table
    pub indexed: usize,
    /// Lines turned into a (vid, sid) pair
    pub resolved: usize,
    /// Lines whose position has no vid in the index table
    pub missing: usize,
    /// Lines that are not an integer or name a shard outside the range
    pub invalid: usize,
}

impl ResolveReport {
    /// True when the partition file and the index table disagree in size.
    pub fn is_mismatched(&self) -> bool {
        self.lines != self.indexed
    }

    /// Logs the counters.
    pub fn log_summary(&self) {
        info!(
            lines = self.lines,
            resolved = self.resolved,
            missing = self.missing,
            invalid = self.invalid,
            "Shard assignment resolved"
        );
    }
}

/// Resolves the partition file against `index`.
///
/// A line-count mismatch is warned about but every line with a matching
/// index is still resolved. Lines without a vid, unparseable lines and shards
/// outside `[0, shard_count)` are counted and not inserted.
pub fn resolve_assignment(
    partition_file: &Path,
    index: &PartitionIndex,
    shard_count: u32,
) -> Result<(ShardAssignment, ResolveReport)> {
    if !partition_file.is_file() {
        return Err(PartitionError::MissingInput {
            what: "partitioner output",
            path: partition_file.to_path_buf(),
        });
    }

    let mut report = ResolveReport {
        indexed: index.len(),
        ..Default::default()
    };
    let mut assignment = ShardAssignment::new();

    let reader = BufReader::new(File::open(partition_file)?);
    for line in reader.lines() {
        let line = line?;
        let value = line.trim();
        if value.is_empty() {
            continue;
        }
        report.lines += 1;
        let position = report.lines as u64;

        let sid = match value.parse::<ShardId>() {
            Ok(sid) if sid < shard_count => sid,
            _ => {
                warn!(index = position, value, shard_count, "Invalid shard in partitioner output");
                report.invalid += 1;
                continue;
            }
        };

        match index.vid_at(position) {
            Some(vid) => {
                assignment.insert(vid, sid);
                report.resolved += 1;
            }
            None => {
                warn!(index = position, "Missing vid for partition index");
                report.missing += 1;
            }
        }
    }

    if report.is_mismatched() {
        warn!(
            lines = report.lines,
            indexed = report.indexed,
            "Partitioner output does not match the index map, the graph file may be stale"
        );
    }

    Ok((assignment, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn index_of(vids: &[u64]) -> PartitionIndex {
        PartitionIndex::from_sorted(vids.iter().map(|v| Vid(*v)))
    }

    fn partition_file(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("graph.txt.part.2");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_resolve_positional() {
        let dir = TempDir::new().unwrap();
        let path = partition_file(&dir, "0\n1\n\n1\n");

        let (assignment, report) = resolve_assignment(&path, &index_of(&[4, 9, 15]), 2).unwrap();

        assert_eq!(assignment.get(Vid(4)), Some(0));
        assert_eq!(assignment.get(Vid(9)), Some(1));
        assert_eq!(assignment.get(Vid(15)), Some(1));
        assert_eq!(report.resolved, 3);
        assert!(!report.is_mismatched());
        assert_eq!(assignment.shard_sizes(), BTreeMap::from([(0, 1), (1, 2)]));
    }

    #[test]
    fn test_extra_lines_are_reported_missing() {
        let dir = TempDir::new().unwrap();
        let path = partition_file(&dir, "0\n1\n0\n1\n");

        let (assignment, report) = resolve_assignment(&path, &index_of(&[4, 9]), 2).unwrap();

        assert_eq!(assignment.len(), 2);
        assert_eq!(report.missing, 2);
        assert!(report.is_mismatched());
    }

    #[test]
    fn test_short_output_resolves_what_it_can() {
        let dir = TempDir::new().unwrap();
        let path = partition_file(&dir, "1\n");

        let (assignment, report) = resolve_assignment(&path, &index_of(&[4, 9, 15]), 2).unwrap();

        assert_eq!(assignment.get(Vid(4)), Some(1));
        assert_eq!(assignment.get(Vid(9)), None);
        assert!(report.is_mismatched());
    }

    #[test]
    fn test_invalid_lines_keep_their_position() {
        let dir = TempDir::new().unwrap();
        let path = partition_file(&dir, "x\n7\n1\n");

        let (assignment, report) = resolve_assignment(&path, &index_of(&[4, 9, 15]), 2).unwrap();

        assert_eq!(report.invalid, 2);
        assert_eq!(assignment.get(Vid(4)), None);
        assert_eq!(assignment.get(Vid(9)), None);
        assert_eq!(assignment.get(Vid(15)), Some(1));
    }

    #[test]
    fn test_missing_partition_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = resolve_assignment(&dir.path().join("nope"), &index_of(&[1]), 2).unwrap_err();
        assert!(matches!(err, PartitionError::MissingInput { .. }));
    }

    #[test]
    fn test_assignment_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ASSIGNMENT_FILE);
        let mut assignment = ShardAssignment::new();
        assignment.insert(Vid(12), 1);
        assignment.insert(Vid(3), 0);
        assignment.write(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "vid,sid\n3,0\n12,1\n");
        assert_eq!(ShardAssignment::load(&path, 2).unwrap(), (assignment, 0));
    }

    #[test]
    fn test_load_rejects_out_of_range_shards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ASSIGNMENT_FILE);
        fs::write(&path, "vid,sid\n1,0\n2,0\n3,2\nx,1\n").unwrap();

        let (assignment, invalid) = ShardAssignment::load(&path, 2).unwrap();

        assert_eq!(invalid, 2);
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment.get(Vid(3)), None);
    }
}
