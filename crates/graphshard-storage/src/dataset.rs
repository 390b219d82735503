//! Dataset reading for graphshard.
//!
//! Records come from `|`-delimited files with a header row, stored in one of
//! several input areas under the dataset root:
//!
//! ```text
//! <root>/
//! ├── static/
//! │   ├── place_0_0.csv
//! │   └── organisation_isLocatedIn_place_0_0.csv
//! └── dynamic/
//!     ├── person_0_0.csv
//!     └── person_knows_person_0_0.csv
//! ```
//!
//! ## Node File Format
//!
//! ```csv
//! id|firstName|lastName|gender|birthday|creationDate|locationIP|browserUsed
//! 933|Mahinda|Perera|male|1989-12-03|2010-02-14T15:32:10.447+0000|119.235.7.103|Firefox
//! ```
//!
//! ## Relationship File Format
//!
//! ```csv
//! Person.id|Person.id|creationDate
//! 933|4139|2010-03-13T07:37:21.718+0000
//! ```
//!
//! The two endpoint ids are always the first two columns; attributes follow.

use graphshard_core::{parse_attributes, Attributes, CoreError, EntityType, RawId, RelationType};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while opening dataset files.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Dataset file {file} not found in any area of {}", root.display())]
    NotFound { file: String, root: PathBuf },
}

/// Result type for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Why a single record was rejected. Never fatal to a run.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Missing required field {0}")]
    MissingField(String),

    #[error("Invalid id in field {field}: {value:?}")]
    InvalidId { field: String, value: String },

    #[error(transparent)]
    Value(#[from] CoreError),

    #[error("Unreadable row: {0}")]
    Unreadable(#[from] csv::Error),
}

/// A record rejected at `line` of its file. Line 0 means the position is
/// unknown.
#[derive(Error, Debug)]
#[error("line {line}: {error}")]
pub struct RejectedRow {
    pub line: u64,
    #[source]
    pub error: RecordError,
}

/// Locates and reads dataset files.
#[derive(Debug, Clone)]
pub struct DatasetReader {
    root: PathBuf,
    areas: Vec<String>,
    delimiter: u8,
}

impl DatasetReader {
    /// Creates a reader over `root`, searching the `static` and `dynamic` areas.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            areas: vec!["static".to_string(), "dynamic".to_string()],
            delimiter: b'|',
        }
    }

    /// Replaces the searched input areas (sub-directories of the root).
    pub fn with_areas(mut self, areas: Vec<String>) -> Self {
        self.areas = areas;
        self
    }

    /// Sets the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Returns the dataset root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Finds `file_name` in the first area that contains it.
    pub fn locate(&self, file_name: &str) -> Result<PathBuf> {
        self.areas
            .iter()
            .map(|area| self.root.join(area).join(file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| DatasetError::NotFound {
                file: file_name.to_string(),
                root: self.root.clone(),
            })
    }

    /// Opens the rows of a dataset file by name.
    pub fn read_rows(&self, file_name: &str) -> Result<RowReader> {
        let path = self.locate(file_name)?;
        RowReader::open(&path, self.delimiter)
    }

    /// Opens the node records of an entity type.
    pub fn entity_rows(&self, entity: EntityType) -> Result<RowReader> {
        self.read_rows(entity.file_name())
    }

    /// Opens the records of a relationship type.
    pub fn relation_rows(&self, relation: RelationType) -> Result<RowReader> {
        self.read_rows(&relation.file_name())
    }
}

/// One record, addressable by column name or position.
#[derive(Debug, Clone)]
pub struct Row {
    headers: Arc<[String]>,
    record: csv::StringRecord,
}

impl Row {
    /// Returns the cell under column `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| self.record.get(idx))
    }

    /// Returns the cell at position `idx`.
    pub fn get_at(&self, idx: usize) -> Option<&str> {
        self.record.get(idx)
    }

    /// Returns the 1-based line number of the record in its file.
    pub fn line(&self) -> u64 {
        self.record.position().map(|p| p.line()).unwrap_or(0)
    }
}

/// Streaming iterator over the rows of one file.
pub struct RowReader {
    path: PathBuf,
    headers: Arc<[String]>,
    records: csv::StringRecordsIntoIter<File>,
}

impl RowReader {
    /// Opens `path` as a delimited file with a header row.
    pub fn open(path: &Path, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let headers: Arc<[String]> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            records: reader.into_records(),
        })
    }

    /// Returns the path being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for RowReader {
    type Item = std::result::Result<Row, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(
            record
                .map(|record| Row {
                    headers: Arc::clone(&self.headers),
                    record,
                })
                .map_err(RecordError::from),
        )
    }
}

/// Applies `parse` to a row read from a [`RowReader`], tagging any failure
/// with the line it came from.
pub fn parse_row<T>(
    row: std::result::Result<Row, RecordError>,
    parse: impl FnOnce(&Row) -> std::result::Result<T, RecordError>,
) -> std::result::Result<T, RejectedRow> {
    let row = row.map_err(|error| {
        let line = match &error {
            RecordError::Unreadable(e) => e.position().map(|p| p.line()).unwrap_or(0),
            _ => 0,
        };
        RejectedRow { line, error }
    })?;
    parse(&row).map_err(|error| RejectedRow {
        line: row.line(),
        error,
    })
}

fn parse_raw_id(field: &str, cell: Option<&str>) -> std::result::Result<RawId, RecordError> {
    let cell = cell
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RecordError::MissingField(field.to_string()))?;
    cell.parse().map_err(|_| RecordError::InvalidId {
        field: field.to_string(),
        value: cell.to_string(),
    })
}

/// Extracts the raw id of a node record.
pub fn node_raw_id(row: &Row) -> std::result::Result<RawId, RecordError> {
    parse_raw_id("id", row.get("id"))
}

/// Extracts the raw id and the schema attributes of a node record.
pub fn parse_node(
    entity: EntityType,
    row: &Row,
) -> std::result::Result<(RawId, Attributes), RecordError> {
    let raw_id = node_raw_id(row)?;
    let attributes = parse_attributes(entity.schema(), |name| row.get(name))?;
    Ok((raw_id, attributes))
}

/// Extracts the two endpoint raw ids of a relationship record.
pub fn relationship_endpoints(row: &Row) -> std::result::Result<(RawId, RawId), RecordError> {
    let from = parse_raw_id("from", row.get_at(0))?;
    let to = parse_raw_id("to", row.get_at(1))?;
    Ok((from, to))
}

/// Extracts endpoints and schema attributes of a relationship record.
pub fn parse_relationship(
    relation: RelationType,
    row: &Row,
) -> std::result::Result<(RawId, RawId, Attributes), RecordError> {
    let (from, to) = relationship_endpoints(row)?;
    let attributes = parse_attributes(relation.schema(), |name| row.get(name))?;
    Ok((from, to, attributes))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use graphshard_core::PropertyValue;
    use std::fs;
    use tempfile::TempDir;

    fn dataset(files: &[(&str, &str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (area, name, content) in files {
            let area_dir = dir.path().join(area);
            fs::create_dir_all(&area_dir).unwrap();
            fs::write(area_dir.join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn test_locate_searches_areas_in_order() {
        let dir = dataset(&[
            ("dynamic", "tag_0_0.csv", "id|name|url\n"),
            ("static", "place_0_0.csv", "id|name|url|type\n"),
        ]);
        let reader = DatasetReader::new(dir.path());

        assert!(reader.locate("tag_0_0.csv").unwrap().ends_with("dynamic/tag_0_0.csv"));
        assert!(reader.locate("place_0_0.csv").unwrap().ends_with("static/place_0_0.csv"));
        assert!(matches!(
            reader.locate("forum_0_0.csv"),
            Err(DatasetError::NotFound { .. })
        ));
    }

    #[test]
    fn test_parse_node_rows() {
        let dir = dataset(&[(
            "static",
            "tag_0_0.csv",
            "id|name|url\n0|Rust|http://t/rust\n1|Go|\n",
        )]);
        let reader = DatasetReader::new(dir.path());

        let rows: Vec<Row> = reader
            .entity_rows(EntityType::Tag)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 2);

        let (id, attrs) = parse_node(EntityType::Tag, &rows[0]).unwrap();
        assert_eq!(id, 0);
        assert_eq!(attrs.get("name"), Some(&PropertyValue::String("Rust".into())));

        let (id, attrs) = parse_node(EntityType::Tag, &rows[1]).unwrap();
        assert_eq!(id, 1);
        assert!(!attrs.contains_key("url"));
    }

    #[test]
    fn test_malformed_id_is_a_record_error() {
        let dir = dataset(&[("static", "tag_0_0.csv", "id|name|url\nabc|Rust|x\n|Go|y\n")]);
        let reader = DatasetReader::new(dir.path());
        let rows: Vec<Row> = reader
            .entity_rows(EntityType::Tag)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert!(matches!(node_raw_id(&rows[0]), Err(RecordError::InvalidId { .. })));
        assert!(matches!(node_raw_id(&rows[1]), Err(RecordError::MissingField(_))));
    }

    #[test]
    fn test_rejected_rows_carry_their_line() {
        let dir = dataset(&[("static", "tag_0_0.csv", "id|name|url
1|Rust|x

abc|Go|y
")]);
        let reader = DatasetReader::new(dir.path());
        let mut rows = reader.entity_rows(EntityType::Tag).unwrap();

        assert_eq!(parse_row(rows.next().unwrap(), node_raw_id).unwrap(), 1);

        let rejected = parse_row(rows.next().unwrap(), node_raw_id).unwrap_err();
        assert_eq!(rejected.line, 4);
        assert!(matches!(rejected.error, RecordError::InvalidId { .. }));
        assert!(rejected.to_string().starts_with("line 4: "));
    }

    #[test]
    fn test_parse_relationship_rows() {
        let dir = dataset(&[(
            "dynamic",
            "person_knows_person_0_0.csv",
            "Person.id|Person.id|creationDate\n1|2|2010-03-13T07:37:21.718+0000\n3\n",
        )]);
        let reader = DatasetReader::new(dir.path());
        let rows: Vec<Row> = reader
            .relation_rows(RelationType::PersonKnowsPerson)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        let (from, to, attrs) = parse_relationship(RelationType::PersonKnowsPerson, &rows[0]).unwrap();
        assert_eq!((from, to), (1, 2));
        assert!(matches!(attrs.get("creationDate"), Some(PropertyValue::DateTime(_))));

        assert!(relationship_endpoints(&rows[1]).is_err());
    }
}
