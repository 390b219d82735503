//! Partitioner invocation.
//!
//! The partitioning algorithm itself is external. It reads the adjacency file
//! written by [`PartitionGraph`](super::PartitionGraph) and produces one shard
//! index per line, in node order.

use super::{PartitionError, Result};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// An algorithm that assigns each partition-graph node to a shard.
pub trait Partitioner {
    /// Partitions `graph_file` into `shard_count` parts and returns the path of
    /// the partition file.
    fn partition(&self, graph_file: &Path, shard_count: u32) -> Result<PathBuf>;

    /// Returns a description of the partitioner for logging.
    fn describe(&self) -> String;
}

/// Runs a METIS-compatible program as `<program> [args..] <graph> <parts>`.
///
/// The program is expected to write `<graph>.part.<parts>`.
#[derive(Debug, Clone)]
pub struct MetisPartitioner {
    program: String,
    args: Vec<String>,
}

impl Default for MetisPartitioner {
    fn default() -> Self {
        Self::new("gpmetis")
    }
}

impl MetisPartitioner {
    /// Creates a partitioner invoking `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Adds arguments passed before the graph file.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Path the program writes its output to.
    pub fn output_path(graph_file: &Path, shard_count: u32) -> PathBuf {
        let mut name = graph_file.as_os_str().to_os_string();
        name.push(format!(".part.{shard_count}"));
        PathBuf::from(name)
    }

    /// A single part needs no partitioning: every node goes to shard 0.
    fn write_single_part(graph_file: &Path, output: &Path) -> Result<()> {
        let mut header = String::new();
        BufReader::new(fs::File::open(graph_file)?).read_line(&mut header)?;
        let nodes: usize = header
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        fs::write(output, "0\n".repeat(nodes))?;
        Ok(())
    }
}

impl Partitioner for MetisPartitioner {
    fn partition(&self, graph_file: &Path, shard_count: u32) -> Result<PathBuf> {
        if shard_count == 0 {
            return Err(PartitionError::InvalidShardCount(shard_count));
        }
        if !graph_file.is_file() {
            return Err(PartitionError::MissingInput {
                what: "partition graph",
                path: graph_file.to_path_buf(),
            });
        }

        let output = Self::output_path(graph_file, shard_count);
        if shard_count == 1 {
            Self::write_single_part(graph_file, &output)?;
            info!(output = %output.display(), "Single shard, skipping partitioner");
            return Ok(output);
        }

        info!(program = %self.program, graph = %graph_file.display(), shard_count, "Running partitioner");
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(graph_file)
            .arg(shard_count.to_string())
            .output()?;
        debug!(stdout = %String::from_utf8_lossy(&result.stdout), "Partitioner output");

        if !result.status.success() {
            return Err(PartitionError::Partitioner {
                program: self.program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.is_file() {
            return Err(PartitionError::MissingInput {
                what: "partitioner output",
                path: output,
            });
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!("MetisPartitioner(program={})", self.program)
    }
}
