//! Identity virtualization.
//!
//! Every node record is given a [`Vid`] that is unique across all entity
//! types. Vids come from a single [`VidSequence`] and are recorded in one
//! [`VidMap`] per entity type. Both are persisted under the state directory:
//!
//! ```text
//! <state>/
//! ├── vid_counter.txt          # next vid to issue
//! ├── person_vid_map.csv       # original_id,vid
//! ├── place_vid_map.csv
//! └── ...
//! ```
//!
//! On restart the counter and the maps are reloaded before anything new is
//! issued, so existing vids are never reused or reassigned.

use crate::dataset::{node_raw_id, parse_row, DatasetError, DatasetReader};
use graphshard_core::{EntityType, RawId, Vid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the persisted vid counter.
pub const COUNTER_FILE: &str = "vid_counter.txt";

/// Errors raised while loading or persisting identity state.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Corrupt vid counter in {}: {value:?}", path.display())]
    CorruptCounter { path: PathBuf, value: String },

    #[error("VID map for {entity} not found at {}", path.display())]
    MissingMap { entity: EntityType, path: PathBuf },
}

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;

// =============================================================================
// Sequence Generator
// =============================================================================

/// Monotonic generator of vids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidSequence {
    next: u64,
}

impl Default for VidSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl VidSequence {
    /// Creates a sequence whose first vid is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequence whose next vid is `next`.
    pub fn starting_at(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    /// Returns the vid the next call to [`VidSequence::next_vid`] will issue.
    pub fn peek(&self) -> Vid {
        Vid(self.next)
    }

    /// Issues a fresh vid.
    pub fn next_vid(&mut self) -> Vid {
        let vid = Vid(self.next);
        self.next += 1;
        vid
    }

    /// Moves the sequence past `vid` if it is not already.
    pub fn advance_past(&mut self, vid: Vid) {
        if self.next <= vid.0 {
            self.next = vid.0 + 1;
        }
    }

    /// Loads the counter file. A missing file yields a fresh sequence.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let contents = fs::read_to_string(path)?;
        let value = contents.trim();
        value
            .parse::<u64>()
            .map(Self::starting_at)
            .map_err(|_| IdentityError::CorruptCounter {
                path: path.to_path_buf(),
                value: value.to_string(),
            })
    }

    /// Writes the counter file.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.next.to_string())?;
        Ok(())
    }
}

// =============================================================================
// VID Maps
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct VidMapRow {
    original_id: RawId,
    vid: u64,
}

/// Raw id → vid table of one entity type.
#[derive(Debug, Clone)]
pub struct VidMap {
    entity: EntityType,
    by_raw: HashMap<RawId, Vid>,
}

impl VidMap {
    /// Creates an empty map.
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            by_raw: HashMap::new(),
        }
    }

    /// File name of the persisted map of `entity`.
    pub fn file_name(entity: EntityType) -> String {
        format!("{}_vid_map.csv", entity.key())
    }

    /// Returns the entity type of this map.
    pub fn entity(&self) -> EntityType {
        self.entity
    }

    /// Looks up the vid of a raw id.
    #[inline]
    pub fn get(&self, raw_id: RawId) -> Option<Vid> {
        self.by_raw.get(&raw_id).copied()
    }

    /// Number of mapped records.
    pub fn len(&self) -> usize {
        self.by_raw.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.by_raw.is_empty()
    }

    /// Highest vid in the map.
    pub fn max_vid(&self) -> Option<Vid> {
        self.by_raw.values().copied().max()
    }

    /// Entries in insertion order. Vids are issued monotonically, so this is
    /// ascending vid order.
    pub fn entries(&self) -> Vec<(RawId, Vid)> {
        let mut entries: Vec<_> = self.by_raw.iter().map(|(r, v)| (*r, *v)).collect();
        entries.sort_by_key(|(_, vid)| *vid);
        entries
    }

    fn insert(&mut self, raw_id: RawId, vid: Vid) {
        self.by_raw.insert(raw_id, vid);
    }

    /// Loads a persisted map. Malformed rows are skipped with a warning.
    pub fn load(entity: EntityType, path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(IdentityError::MissingMap {
                entity,
                path: path.to_path_buf(),
            });
        }

        let mut map = Self::new(entity);
        let mut reader = csv::Reader::from_path(path)?;
        for row in reader.deserialize::<VidMapRow>() {
            match row {
                Ok(row) => map.insert(row.original_id, Vid(row.vid)),
                Err(e) => warn!(%entity, path = %path.display(), error = %e, "Skipping malformed VID map row"),
            }
        }
        debug!(%entity, entries = map.len(), "Loaded VID map");
        Ok(map)
    }

    /// Writes the map as `original_id,vid` in insertion order.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (original_id, vid) in self.entries() {
            writer.serialize(VidMapRow {
                original_id,
                vid: vid.0,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One [`VidMap`] per entity type, keyed by the entity enum.
#[derive(Debug, Clone)]
pub struct VidMaps {
    maps: [VidMap; EntityType::COUNT],
}

impl Default for VidMaps {
    fn default() -> Self {
        Self {
            maps: EntityType::ALL.map(VidMap::new),
        }
    }
}

impl VidMaps {
    /// Creates empty maps for every entity type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the map of `entity`.
    #[inline]
    pub fn get(&self, entity: EntityType) -> &VidMap {
        &self.maps[entity.index()]
    }

    fn get_mut(&mut self, entity: EntityType) -> &mut VidMap {
        &mut self.maps[entity.index()]
    }

    /// Resolves `(entity, raw_id)` to its vid.
    #[inline]
    pub fn vid_of(&self, entity: EntityType, raw_id: RawId) -> Option<Vid> {
        self.get(entity).get(raw_id)
    }

    /// Total number of vids across all types.
    pub fn total(&self) -> usize {
        self.maps.iter().map(VidMap::len).sum()
    }

    /// Iterates every `(entity, vid)` pair.
    pub fn iter_vids(&self) -> impl Iterator<Item = (EntityType, Vid)> + '_ {
        self.maps
            .iter()
            .flat_map(|map| map.by_raw.values().map(move |vid| (map.entity, *vid)))
    }

    /// Loads the maps of `required` from `dir`. A missing map is fatal.
    pub fn load_required(dir: &Path, required: &[EntityType]) -> Result<Self> {
        let mut maps = Self::new();
        for &entity in required {
            maps.maps[entity.index()] = VidMap::load(entity, &dir.join(VidMap::file_name(entity)))?;
        }
        Ok(maps)
    }

    /// Loads every map present in `dir`, leaving absent ones empty.
    pub fn load_existing(dir: &Path) -> Result<Self> {
        let mut maps = Self::new();
        for entity in EntityType::ALL {
            let path = dir.join(VidMap::file_name(entity));
            if path.is_file() {
                maps.maps[entity.index()] = VidMap::load(entity, &path)?;
            }
        }
        Ok(maps)
    }

    /// Writes every non-empty map into `dir`.
    pub fn write_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for map in self.maps.iter().filter(|m| !m.is_empty()) {
            let path = dir.join(VidMap::file_name(map.entity));
            map.write(&path)?;
            info!(entity = %map.entity, entries = map.len(), path = %path.display(), "Exported VID map");
        }
        Ok(())
    }
}

// =============================================================================
// Identity Virtualizer
// =============================================================================

/// Counters of one identity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityReport {
    /// Records that received a new vid
    pub assigned: u64,
    /// Records whose `(type, raw id)` already had a vid
    pub already_known: u64,
    /// Records skipped because their id was missing or malformed
    pub unparseable: u64,
}

impl IdentityReport {
    /// Logs the counters.
    pub fn log_summary(&self) {
        info!(
            assigned = self.assigned,
            already_known = self.already_known,
            unparseable = self.unparseable,
            "Identity virtualization finished"
        );
    }
}

/// Assigns and persists global vids.
#[derive(Debug, Clone, Default)]
pub struct IdentityVirtualizer {
    sequence: VidSequence,
    maps: VidMaps,
}

impl IdentityVirtualizer {
    /// Creates a virtualizer with no prior state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a virtualizer from existing state.
    ///
    /// The sequence is moved past the highest vid in `maps`.
    pub fn with_state(mut sequence: VidSequence, maps: VidMaps) -> Self {
        if let Some(max) = maps.iter_vids().map(|(_, vid)| vid).max() {
            if sequence.peek() <= max {
                warn!(
                    counter = sequence.peek().0,
                    max_vid = max.0,
                    "Vid counter is behind persisted maps, resuming after the highest vid"
                );
                sequence.advance_past(max);
            }
        }
        Self { sequence, maps }
    }

    /// Reloads the counter and every existing map from `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let sequence = VidSequence::load(&state_dir.join(COUNTER_FILE))?;
        let maps = VidMaps::load_existing(state_dir)?;
        info!(next_vid = sequence.peek().0, known = maps.total(), "Opened identity state");
        Ok(Self::with_state(sequence, maps))
    }

    /// Returns the vid of `(entity, raw_id)`, issuing one if it has none yet.
    pub fn assign(&mut self, entity: EntityType, raw_id: RawId) -> Vid {
        if let Some(vid) = self.maps.vid_of(entity, raw_id) {
            return vid;
        }
        let vid = self.sequence.next_vid();
        self.maps.get_mut(entity).insert(raw_id, vid);
        vid
    }

    /// Looks up an already assigned vid.
    pub fn vid_of(&self, entity: EntityType, raw_id: RawId) -> Option<Vid> {
        self.maps.vid_of(entity, raw_id)
    }

    /// Returns the sequence.
    pub fn sequence(&self) -> &VidSequence {
        &self.sequence
    }

    /// Returns the maps.
    pub fn maps(&self) -> &VidMaps {
        &self.maps
    }

    /// Consumes the virtualizer, returning its maps.
    pub fn into_maps(self) -> VidMaps {
        self.maps
    }

    /// Scans the node files of `entities` and assigns a vid to every record.
    ///
    /// A missing node file is fatal; a record with a missing or malformed id
    /// is skipped and counted.
    pub fn scan(
        &mut self,
        reader: &DatasetReader,
        entities: &[EntityType],
    ) -> Result<IdentityReport> {
        let mut report = IdentityReport::default();

        for &entity in entities {
            let rows = reader.entity_rows(entity)?;
            info!(%entity, path = %rows.path().display(), "Reading ids");

            for row in rows {
                let raw_id = match parse_row(row, node_raw_id) {
                    Ok(raw_id) => raw_id,
                    Err(e) => {
                        warn!(%entity, line = e.line, error = %e.error, "Skipping unparseable node record");
                        report.unparseable += 1;
                        continue;
                    }
                };

                if self.maps.vid_of(entity, raw_id).is_some() {
                    report.already_known += 1;
                } else {
                    self.assign(entity, raw_id);
                    report.assigned += 1;
                }
            }
        }

        Ok(report)
    }

    /// Persists the counter and every map into `state_dir`.
    pub fn persist(&self, state_dir: &Path) -> Result<()> {
        self.maps.write_dir(state_dir)?;
        self.sequence.save(&state_dir.join(COUNTER_FILE))?;
        debug!(next_vid = self.sequence.peek().0, "Saved vid counter");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write_dataset(dir: &Path) {
        let area = dir.join("static");
        fs::create_dir_all(&area).unwrap();
        fs::write(area.join("tag_0_0.csv"), "id|name|url\n10|a|\n11|b|\nxx|c|\n10|a|\n").unwrap();
        fs::write(area.join("place_0_0.csv"), "id|name|url|type\n10|x||city\n").unwrap();
    }

    #[test]
    fn test_assign_is_idempotent_and_unique() {
        let mut virt = IdentityVirtualizer::new();

        let a = virt.assign(EntityType::Person, 1);
        let b = virt.assign(EntityType::Place, 1);
        let a_again = virt.assign(EntityType::Person, 1);

        assert_eq!(a, Vid(1));
        assert_eq!(b, Vid(2));
        assert_eq!(a, a_again);
        assert_eq!(virt.vid_of(EntityType::Place, 1), Some(b));
        assert_eq!(virt.vid_of(EntityType::Tag, 1), None);
    }

    #[test]
    fn test_vids_are_disjoint_across_types() {
        let mut virt = IdentityVirtualizer::new();
        let mut seen = HashSet::new();
        for entity in EntityType::ALL {
            for raw in 0..50 {
                assert!(seen.insert(virt.assign(entity, raw)));
            }
        }
        assert_eq!(virt.maps().total(), EntityType::COUNT * 50);
    }

    #[test]
    fn test_scan_counts_skips_and_duplicates() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path());
        let reader = DatasetReader::new(dir.path());

        let mut virt = IdentityVirtualizer::new();
        let report = virt
            .scan(&reader, &[EntityType::Tag, EntityType::Place])
            .unwrap();

        assert_eq!(report.assigned, 3);
        assert_eq!(report.already_known, 1);
        assert_eq!(report.unparseable, 1);
        assert_eq!(virt.vid_of(EntityType::Tag, 10), Some(Vid(1)));
        assert_eq!(virt.vid_of(EntityType::Place, 10), Some(Vid(3)));
    }

    #[test]
    fn test_scan_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path());
        let reader = DatasetReader::new(dir.path());

        let err = IdentityVirtualizer::new()
            .scan(&reader, &[EntityType::Forum])
            .unwrap_err();
        assert!(matches!(err, IdentityError::Dataset(DatasetError::NotFound { .. })));
    }

    #[test]
    fn test_persist_and_resume() {
        let dir = TempDir::new().unwrap();
        let mut virt = IdentityVirtualizer::new();
        virt.assign(EntityType::Tag, 5);
        virt.assign(EntityType::Tag, 6);
        virt.persist(dir.path()).unwrap();

        let mut resumed = IdentityVirtualizer::open(dir.path()).unwrap();
        assert_eq!(resumed.vid_of(EntityType::Tag, 6), Some(Vid(2)));
        assert_eq!(resumed.assign(EntityType::Tag, 6), Vid(2));
        assert_eq!(resumed.assign(EntityType::Person, 1), Vid(3));
    }

    #[test]
    fn test_resume_without_counter_skips_past_existing_vids() {
        let dir = TempDir::new().unwrap();
        let mut virt = IdentityVirtualizer::new();
        for raw in 0..4 {
            virt.assign(EntityType::Forum, raw);
        }
        virt.persist(dir.path()).unwrap();
        fs::remove_file(dir.path().join(COUNTER_FILE)).unwrap();

        let mut resumed = IdentityVirtualizer::open(dir.path()).unwrap();
        assert_eq!(resumed.assign(EntityType::Forum, 99), Vid(5));
    }

    #[test]
    fn test_corrupt_counter_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(COUNTER_FILE), "twelve").unwrap();
        assert!(matches!(
            IdentityVirtualizer::open(dir.path()),
            Err(IdentityError::CorruptCounter { .. })
        ));
    }

    #[test]
    fn test_export_is_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut virt = IdentityVirtualizer::new();
        for raw in [30, 10, 20] {
            virt.assign(EntityType::Tag, raw);
        }
        virt.persist(dir.path()).unwrap();

        let contents = fs::read_to_string(dir.path().join("tag_vid_map.csv")).unwrap();
        assert_eq!(contents, "original_id,vid\n30,1\n10,2\n20,3\n");
    }

    #[test]
    fn test_load_required_missing_map() {
        let dir = TempDir::new().unwrap();
        let err = VidMaps::load_required(dir.path(), &[EntityType::Person]).unwrap_err();
        assert!(matches!(err, IdentityError::MissingMap { .. }));
    }
}
