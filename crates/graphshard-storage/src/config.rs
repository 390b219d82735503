//! Unified configuration for graphshard.
//!
//! This module provides centralized configuration management with support for:
//! - Default values (embedded in binary)
//! - Configuration files (TOML format, `graphshard.toml` by default)
//! - Environment variable overrides (prefix: `GSHARD__`)
//!
//! # Environment Variables
//!
//! - `GSHARD__DATASET__ROOT=/data/social_network`
//! - `GSHARD__STATE__DIR=partitioned_vids`
//! - `GSHARD__PARTITION__SHARD_COUNT=4`
//! - `GSHARD__PARTITION__PROGRAM=/opt/metis/bin/gpmetis`
//! - `GSHARD__SHARDS__USERNAME=neo4j` / `GSHARD__SHARDS__PASSWORD=secret`
//! - `GSHARD__LOADER__BATCH_SIZE=1000`
//! - `GSHARD__LOADER__BACKEND=memory`
//!
//! # Example
//!
//! ```toml
//! [partition]
//! shard_count = 2
//!
//! [[shards.endpoints]]
//! sid = 0
//! address = "http://localhost:7474"
//!
//! [[shards.endpoints]]
//! sid = 1
//! address = "http://localhost:7475"
//! ```

use crate::dataset::DatasetReader;
use graphshard_core::{EntityType, RelationType, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "graphshard.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphshardConfig {
    /// Input dataset
    pub dataset: DatasetConfig,
    /// Persisted tables
    pub state: StateConfig,
    /// Partition graph and partitioner
    pub partition: PartitionConfig,
    /// Shard endpoints
    pub shards: ShardsConfig,
    /// Batch loading
    pub loader: LoaderConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl GraphshardConfig {
    /// Loads configuration from an optional file path with environment variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GSHARD__*)
    /// 2. Configuration file (if provided and present)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GSHARD__DATASET__ROOT") {
            self.dataset.root = val;
        }
        if let Ok(val) = std::env::var("GSHARD__STATE__DIR") {
            self.state.dir = val;
        }
        if let Ok(val) = std::env::var("GSHARD__STATE__GRAPH_DIR") {
            self.state.graph_dir = val;
        }

        if let Ok(val) = std::env::var("GSHARD__PARTITION__SHARD_COUNT") {
            if let Ok(v) = val.parse() {
                self.partition.shard_count = v;
            }
        }
        if let Ok(val) = std::env::var("GSHARD__PARTITION__PROGRAM") {
            self.partition.program = val;
        }

        if let Ok(val) = std::env::var("GSHARD__SHARDS__USERNAME") {
            self.shards.username = Some(val);
        }
        if let Ok(val) = std::env::var("GSHARD__SHARDS__PASSWORD") {
            self.shards.password = Some(val);
        }
        if let Ok(val) = std::env::var("GSHARD__SHARDS__DATABASE") {
            self.shards.database = val;
        }

        if let Ok(val) = std::env::var("GSHARD__LOADER__BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.loader.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("GSHARD__LOADER__MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.loader.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("GSHARD__LOADER__BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => self.loader.backend = StoreBackend::Memory,
                "neo4j" => self.loader.backend = StoreBackend::Neo4j,
                _ => {}
            }
        }

        if let Ok(val) = std::env::var("GSHARD__LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("GSHARD__LOGGING__JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let shard_count = self.partition.shard_count;
        if shard_count == 0 {
            return Err(ConfigError::Invalid("partition.shard_count must be at least 1".into()));
        }
        if self.loader.batch_size == 0 {
            return Err(ConfigError::Invalid("loader.batch_size must be at least 1".into()));
        }
        if self.dataset.delimiter.len_utf8() != 1 {
            return Err(ConfigError::Invalid("dataset.delimiter must be a single byte".into()));
        }

        if self.loader.backend == StoreBackend::Neo4j {
            let mut seen = BTreeSet::new();
            for endpoint in &self.shards.endpoints {
                if endpoint.sid >= shard_count {
                    return Err(ConfigError::Invalid(format!(
                        "shard endpoint {} is outside 0..{shard_count}",
                        endpoint.sid
                    )));
                }
                if !seen.insert(endpoint.sid) {
                    return Err(ConfigError::Invalid(format!(
                        "shard {} has more than one endpoint",
                        endpoint.sid
                    )));
                }
            }
            if let Some(missing) = (0..shard_count).find(|sid| !seen.contains(sid)) {
                return Err(ConfigError::Invalid(format!("shard {missing} has no endpoint")));
            }
        }
        Ok(())
    }

    /// Serializes the configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Dataset reader over the configured root.
    pub fn dataset_reader(&self) -> DatasetReader {
        DatasetReader::new(&self.dataset.root)
            .with_areas(self.dataset.areas.clone())
            .with_delimiter(self.dataset.delimiter as u8)
    }
}

/// Input dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Dataset root directory
    pub root: String,
    /// Sub-directories searched for files, in order
    pub areas: Vec<String>,
    /// Field delimiter
    pub delimiter: char,
    /// Node types to virtualize and load
    pub entities: Vec<EntityType>,
    /// Relationship types to load
    pub relations: Vec<RelationType>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: "import/social_network".to_string(),
            areas: vec!["static".to_string(), "dynamic".to_string()],
            delimiter: '|',
            entities: EntityType::ALL.to_vec(),
            relations: RelationType::ALL.to_vec(),
        }
    }
}

/// Persisted state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory for vid maps, counter, assignment and side tables
    pub dir: String,
    /// Directory for the partition graph and index map
    pub graph_dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: "partitioned_vids".to_string(),
            graph_dir: "graph_outputs".to_string(),
        }
    }
}

impl StateConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }

    pub fn graph_dir(&self) -> PathBuf {
        PathBuf::from(&self.graph_dir)
    }
}

/// Partitioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Number of shards
    pub shard_count: u32,
    /// Relationship types contributing edges to the partition graph
    pub relations: Vec<RelationType>,
    /// METIS-compatible program
    pub program: String,
    /// Extra program arguments, placed before the graph file
    pub args: Vec<String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            shard_count: 2,
            relations: RelationType::PARTITION_DEFAULT.to_vec(),
            program: "gpmetis".to_string(),
            args: Vec::new(),
        }
    }
}

/// Address of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub sid: ShardId,
    pub address: String,
}

/// Shard connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// One endpoint per shard
    pub endpoints: Vec<ShardEndpoint>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database name on every shard
    pub database: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                ShardEndpoint {
                    sid: 0,
                    address: "http://localhost:9750".to_string(),
                },
                ShardEndpoint {
                    sid: 1,
                    address: "http://localhost:9751".to_string(),
                },
            ],
            username: None,
            password: None,
            database: "neo4j".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Where shard writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One Neo4j instance per shard
    Neo4j,
    /// In-process stores, nothing persisted
    Memory,
}

/// Batch loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Records per write batch
    pub batch_size: usize,
    /// Retries of a failed batch before it is given up
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further retry
    pub retry_backoff_ms: u64,
    pub backend: StoreBackend,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 200,
            backend: StoreBackend::Neo4j,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Use JSON format for log output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
