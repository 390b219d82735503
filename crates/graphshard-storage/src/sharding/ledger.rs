//! Durable side tables written during relationship loading.
//!
//! * `{relation}_cross_instance.csv`: one row per cross-shard relationship,
//!   `from_vid,to_vid,props` with the attributes as a JSON object.
//! * `unroutable_vids.csv`: vids that had no shard and were never written.

use super::{PartitionError, Result, ShardAssignment};
use crate::store::{attributes_json, TARGET_SID};
use graphshard_core::{Attributes, EntityType, PropertyValue, RelationType, ShardId, Vid};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the unroutable vid log.
pub const UNROUTABLE_FILE: &str = "unroutable_vids.csv";

/// A relationship whose endpoints live on different shards.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossShardEdge {
    pub from_vid: Vid,
    pub to_vid: Vid,
    pub to_sid: ShardId,
    /// Relationship attributes including the proxy tags
    pub attributes: Attributes,
}

/// Cross-shard relationships of one type, keyed by `(from_vid, to_vid)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossShardLedger {
    relation: RelationType,
    entries: BTreeMap<(Vid, Vid), CrossShardEdge>,
}

impl CrossShardLedger {
    pub fn new(relation: RelationType) -> Self {
        Self {
            relation,
            entries: BTreeMap::new(),
        }
    }

    pub fn file_name(relation: RelationType) -> String {
        format!("{}_cross_instance.csv", relation.key())
    }

    pub fn relation(&self) -> RelationType {
        self.relation
    }

    /// Records an edge. A repeated pair overlays its attributes.
    pub fn record(&mut self, edge: CrossShardEdge) {
        match self.entries.get_mut(&(edge.from_vid, edge.to_vid)) {
            Some(existing) => {
                existing.to_sid = edge.to_sid;
                existing.attributes.extend(edge.attributes);
            }
            None => {
                self.entries.insert((edge.from_vid, edge.to_vid), edge);
            }
        }
    }

    pub fn get(&self, from_vid: Vid, to_vid: Vid) -> Option<&CrossShardEdge> {
        self.entries.get(&(from_vid, to_vid))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CrossShardEdge> {
        self.entries.values()
    }

    /// Writes the table into `dir` and returns its path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(self.relation));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["from_vid", "to_vid", "props"])?;
        for edge in self.entries.values() {
            let props = serde_json::to_string(&attributes_json(&edge.attributes))?;
            writer.write_record([edge.from_vid.0.to_string(), edge.to_vid.0.to_string(), props])?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Loads the table of `relation` from `dir`. A missing file is an empty
    /// table.
    ///
    /// Dates come back as plain strings.
    pub fn load(dir: &Path, relation: RelationType) -> Result<Self> {
        let mut ledger = Self::new(relation);
        let path = dir.join(Self::file_name(relation));
        if !path.is_file() {
            return Ok(ledger);
        }

        let mut reader = csv::Reader::from_path(&path)?;
        for record in reader.records() {
            let record = record?;
            match parse_cross_row(&path, &record) {
                Ok(edge) => ledger.record(edge),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed cross-shard row"),
            }
        }
        Ok(ledger)
    }
}

fn parse_cross_row(path: &Path, record: &csv::StringRecord) -> Result<CrossShardEdge> {
    let malformed = |reason: String| PartitionError::MalformedRow {
        path: path.to_path_buf(),
        reason,
    };
    let vid_at = |idx: usize| -> Result<Vid> {
        record
            .get(idx)
            .and_then(|v| v.trim().parse().ok())
            .map(Vid)
            .ok_or_else(|| malformed(format!("invalid vid in column {idx}")))
    };
    let from_vid = vid_at(0)?;
    let to_vid = vid_at(1)?;
    let props: BTreeMap<String, Value> = serde_json::from_str(record.get(2).unwrap_or("{}"))?;

    let attributes: Attributes = props
        .into_iter()
        .map(|(key, value)| (key, json_property(value)))
        .collect();
    let to_sid = attributes
        .get(TARGET_SID)
        .and_then(PropertyValue::as_int)
        .and_then(|sid| ShardId::try_from(sid).ok())
        .ok_or_else(|| malformed(format!("missing or invalid {TARGET_SID}")))?;

    Ok(CrossShardEdge {
        from_vid,
        to_vid,
        to_sid,
        attributes,
    })
}

fn json_property(value: Value) -> PropertyValue {
    match value {
        Value::Bool(b) => PropertyValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PropertyValue::Int(i),
            None => n.as_f64().map(PropertyValue::Float).unwrap_or_default(),
        },
        Value::String(s) => PropertyValue::String(s),
        Value::Null => PropertyValue::Null,
        other => PropertyValue::String(other.to_string()),
    }
}

// =============================================================================
// Unroutable Vids
// =============================================================================

/// Vids that could not be placed on any shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnroutableLog {
    entries: BTreeMap<Vid, EntityType>,
}

impl UnroutableLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a vid. Returns false if it was already logged.
    pub fn record(&mut self, vid: Vid, entity: EntityType) -> bool {
        self.entries.insert(vid, entity).is_none()
    }

    pub fn contains(&self, vid: Vid) -> bool {
        self.entries.contains_key(&vid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops vids that `assignment` now places on a shard. Returns how many
    /// were dropped.
    pub fn retain_unassigned(&mut self, assignment: &ShardAssignment) -> usize {
        let before = self.entries.len();
        self.entries.retain(|vid, _| assignment.get(*vid).is_none());
        before - self.entries.len()
    }

    /// Writes `vid,entity` rows into `dir` and returns the file path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(UNROUTABLE_FILE);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["vid", "entity"])?;
        for (vid, entity) in &self.entries {
            writer.write_record([vid.0.to_string(), entity.label().to_string()])?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Loads the log from `dir`. A missing file is an empty log.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut log = Self::new();
        let path = dir.join(UNROUTABLE_FILE);
        if !path.is_file() {
            return Ok(log);
        }

        let mut reader = csv::Reader::from_path(&path)?;
        for record in reader.records() {
            let record = record?;
            let vid = record.get(0).and_then(|v| v.parse().ok()).map(Vid);
            let entity = record.get(1).and_then(|e| e.parse::<EntityType>().ok());
            match (vid, entity) {
                (Some(vid), Some(entity)) => {
                    log.record(vid, entity);
                }
                _ => warn!(path = %path.display(), "Skipping malformed unroutable row"),
            }
        }
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EdgeWrite;
    use std::fs;
    use tempfile::TempDir;

    fn cross(from: u64, to: u64, date: &str) -> CrossShardEdge {
        let mut attrs = Attributes::new();
        attrs.insert("creationDate".into(), PropertyValue::DateTime(date.into()));
        let edge = EdgeWrite::proxied(Vid(from), Vid(to), 1, attrs);
        CrossShardEdge {
            from_vid: Vid(from),
            to_vid: Vid(to),
            to_sid: 1,
            attributes: edge.attributes,
        }
    }

    #[test]
    fn test_ledger_dedups_by_pair() {
        let mut ledger = CrossShardLedger::new(RelationType::PersonKnowsPerson);
        ledger.record(cross(2, 3, "2010-01-01"));
        ledger.record(cross(2, 3, "2011-01-01"));
        ledger.record(cross(2, 4, "2010-01-01"));

        assert_eq!(ledger.len(), 2);
        assert_eq!(
            ledger.get(Vid(2), Vid(3)).unwrap().attributes["creationDate"],
            PropertyValue::DateTime("2011-01-01".into())
        );
    }

    #[test]
    fn test_ledger_file_format() {
        let dir = TempDir::new().unwrap();
        let mut ledger = CrossShardLedger::new(RelationType::PersonKnowsPerson);
        ledger.record(cross(2, 3, "2010-01-01"));

        let path = ledger.write(dir.path()).unwrap();

        assert!(path.ends_with("person_knows_person_cross_instance.csv"));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "from_vid,to_vid,props\n2,3,\"{\"\"creationDate\"\":\"\"2010-01-01\"\",\"\"proxy\"\":true,\"\"target_sid\"\":1,\"\"target_vid\"\":3}\"\n"
        );

        let loaded = CrossShardLedger::load(dir.path(), RelationType::PersonKnowsPerson).unwrap();
        let edge = loaded.get(Vid(2), Vid(3)).unwrap();
        assert_eq!(edge.to_sid, 1);
        assert_eq!(edge.attributes["proxy"], PropertyValue::Bool(true));
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = CrossShardLedger::load(dir.path(), RelationType::ForumHasTagTag).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unroutable_log() {
        let dir = TempDir::new().unwrap();
        let mut log = UnroutableLog::new();
        assert!(log.record(Vid(9), EntityType::TagClass));
        assert!(!log.record(Vid(9), EntityType::TagClass));
        log.record(Vid(4), EntityType::Person);

        log.write(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(UNROUTABLE_FILE)).unwrap(),
            "vid,entity\n4,Person\n9,TagClass\n"
        );
        assert_eq!(UnroutableLog::load(dir.path()).unwrap(), log);
    }

    #[test]
    fn test_unroutable_log_drops_assigned_vids() {
        let mut log = UnroutableLog::new();
        log.record(Vid(4), EntityType::Person);
        log.record(Vid(9), EntityType::TagClass);
        let mut assignment = ShardAssignment::new();
        assignment.insert(Vid(4), 1);

        assert_eq!(log.retain_unassigned(&assignment), 1);
        assert!(!log.contains(Vid(4)));
        assert!(log.contains(Vid(9)));
    }

    #[test]
    fn test_malformed_cross_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.csv");
        let row = |fields: &[&str]| csv::StringRecord::from(fields.to_vec());

        let err = parse_cross_row(&path, &row(&["x", "3", "{}"])).unwrap_err();
        assert!(matches!(err, PartitionError::MalformedRow { .. }));

        // a missing or negative target shard must not fall back to shard 0
        let err = parse_cross_row(&path, &row(&["2", "3", "{}"])).unwrap_err();
        assert!(matches!(err, PartitionError::MalformedRow { .. }));
        let err = parse_cross_row(&path, &row(&["2", "3", r#"{"target_sid":-1}"#])).unwrap_err();
        assert!(matches!(err, PartitionError::MalformedRow { .. }));

        let edge = parse_cross_row(&path, &row(&["2", "3", r#"{"target_sid":4}"#])).unwrap();
        assert_eq!(edge.to_sid, 4);
    }
}
