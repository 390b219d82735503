//! # Graphshard Core
//!
//! Core types for the graphshard pipeline.
//!
//! This crate provides the fundamental building blocks:
//! - [`Vid`] and [`ShardId`] - Global virtual identifiers and shard identifiers
//! - [`PropertyValue`] - Typed attribute values
//! - [`EntityType`] and [`RelationType`] - The fixed dataset schema, known at compile time
//! - [`FieldSpec`] - Ordered, typed attribute schemas per entity and relationship

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Identifiers
// =============================================================================

/// A globally unique virtual identifier for a node.
///
/// Vids are dense, positive and span every entity type: two different
/// `(EntityType, raw id)` pairs never share a vid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Vid(pub u64);

impl Vid {
    /// Creates a new Vid from a u64.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Vid {
    #[inline]
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of a shard, an integer in `[0, shard_count)`.
pub type ShardId = u32;

/// Natural identifier of a record, unique only within its entity type.
pub type RawId = u64;

/// Attribute bag of a node or relationship, ordered by field name.
pub type Attributes = BTreeMap<String, PropertyValue>;

// =============================================================================
// Property Values
// =============================================================================

/// A typed attribute value stored on nodes or relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum PropertyValue {
    /// Null/missing value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Date (YYYY-MM-DD)
    Date(String),
    /// DateTime (ISO 8601)
    DateTime(String),
}

impl PropertyValue {
    /// Returns true if the value is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Attempts to get the value as a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to get the value as an i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to get the value as a string slice.
    ///
    /// Dates and datetimes are kept in their textual form and are returned too.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) | PropertyValue::Date(s) | PropertyValue::DateTime(s) => {
                Some(s)
            }
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

// =============================================================================
// Attribute Schemas
// =============================================================================

/// Primitive type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Free text
    Text,
    /// Signed integer
    Int,
    /// Calendar date, `YYYY-MM-DD`
    Date,
    /// Timestamp, `YYYY-MM-DDTHH:MM:SS...`
    DateTime,
}

impl FieldKind {
    /// Parses a raw cell into a value of this kind.
    pub fn parse(self, field: &str, raw: &str) -> Result<PropertyValue> {
        let invalid = || CoreError::InvalidValue {
            field: field.to_string(),
            kind: self,
            value: raw.to_string(),
        };

        match self {
            FieldKind::Text => Ok(PropertyValue::String(raw.to_string())),
            FieldKind::Int => raw
                .parse::<i64>()
                .map(PropertyValue::Int)
                .map_err(|_| invalid()),
            FieldKind::Date => {
                if looks_like_date(raw) && raw.len() == 10 {
                    Ok(PropertyValue::Date(raw.to_string()))
                } else {
                    Err(invalid())
                }
            }
            FieldKind::DateTime => {
                if looks_like_date(raw) && raw.as_bytes().get(10) == Some(&b'T') {
                    Ok(PropertyValue::DateTime(raw.to_string()))
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

fn looks_like_date(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 10
        && bytes[..10].iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// A named, typed attribute in a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Column name in the source file and attribute name in the store
    pub name: &'static str,
    /// Primitive type of the attribute
    pub kind: FieldKind,
}

const fn text(name: &'static str) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::Text }
}

const fn int(name: &'static str) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::Int }
}

const fn date(name: &'static str) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::Date }
}

const fn date_time(name: &'static str) -> FieldSpec {
    FieldSpec { name, kind: FieldKind::DateTime }
}

/// Parses the non-empty cells named by `schema` out of `lookup`.
///
/// Empty or absent cells are left out of the result rather than stored as nulls.
pub fn parse_attributes<'a>(
    schema: &[FieldSpec],
    mut lookup: impl FnMut(&str) -> Option<&'a str>,
) -> Result<Attributes> {
    let mut attributes = Attributes::new();
    for spec in schema {
        if let Some(raw) = lookup(spec.name).map(str::trim).filter(|s| !s.is_empty()) {
            attributes.insert(spec.name.to_string(), spec.kind.parse(spec.name, raw)?);
        }
    }
    Ok(attributes)
}

// =============================================================================
// Entity Types
// =============================================================================

/// The node kinds of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Person,
    Place,
    Organisation,
    Forum,
    Tag,
    TagClass,
}

impl EntityType {
    /// Every entity type, in load order.
    pub const ALL: [EntityType; 6] = [
        EntityType::Person,
        EntityType::Place,
        EntityType::Organisation,
        EntityType::Forum,
        EntityType::Tag,
        EntityType::TagClass,
    ];

    /// Number of entity types.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index of this type, usable for enum-keyed tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Node label in the graph store.
    pub const fn label(self) -> &'static str {
        match self {
            EntityType::Person => "Person",
            EntityType::Place => "Place",
            EntityType::Organisation => "Organisation",
            EntityType::Forum => "Forum",
            EntityType::Tag => "Tag",
            EntityType::TagClass => "TagClass",
        }
    }

    /// Lowercase key used in file names and configuration.
    pub const fn key(self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Place => "place",
            EntityType::Organisation => "organisation",
            EntityType::Forum => "forum",
            EntityType::Tag => "tag",
            EntityType::TagClass => "tagclass",
        }
    }

    /// Source file holding this type's records.
    pub const fn file_name(self) -> &'static str {
        match self {
            EntityType::Person => "person_0_0.csv",
            EntityType::Place => "place_0_0.csv",
            EntityType::Organisation => "organisation_0_0.csv",
            EntityType::Forum => "forum_0_0.csv",
            EntityType::Tag => "tag_0_0.csv",
            EntityType::TagClass => "tagclass_0_0.csv",
        }
    }

    /// Ordered attribute schema.
    pub const fn schema(self) -> &'static [FieldSpec] {
        const PERSON: &[FieldSpec] = &[
            text("firstName"),
            text("lastName"),
            text("gender"),
            date("birthday"),
            date_time("creationDate"),
            text("locationIP"),
            text("browserUsed"),
        ];
        const PLACE: &[FieldSpec] = &[text("name"), text("url"), text("type")];
        const ORGANISATION: &[FieldSpec] = &[text("type"), text("name"), text("url")];
        const FORUM: &[FieldSpec] = &[text("title"), date_time("creationDate")];
        const NAMED: &[FieldSpec] = &[text("name"), text("url")];

        match self {
            EntityType::Person => PERSON,
            EntityType::Place => PLACE,
            EntityType::Organisation => ORGANISATION,
            EntityType::Forum => FORUM,
            EntityType::Tag | EntityType::TagClass => NAMED,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.key() == wanted)
            .ok_or_else(|| CoreError::UnknownEntity(s.to_string()))
    }
}

impl Serialize for EntityType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Relationship Types
// =============================================================================

/// The relationship kinds of the dataset, each between two fixed entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationType {
    OrganisationIsLocatedInPlace,
    PersonKnowsPerson,
    ForumHasModeratorPerson,
    PersonIsLocatedInPlace,
    ForumHasTagTag,
    TagHasTypeTagClass,
    ForumHasMemberPerson,
    PersonHasInterestTag,
    PersonStudyAtOrganisation,
    PersonWorkAtOrganisation,
    PlaceIsPartOfPlace,
    TagClassIsSubclassOfTagClass,
}

impl RelationType {
    /// Every relationship type.
    pub const ALL: [RelationType; 12] = [
        RelationType::OrganisationIsLocatedInPlace,
        RelationType::PersonKnowsPerson,
        RelationType::ForumHasModeratorPerson,
        RelationType::PersonIsLocatedInPlace,
        RelationType::ForumHasTagTag,
        RelationType::TagHasTypeTagClass,
        RelationType::ForumHasMemberPerson,
        RelationType::PersonHasInterestTag,
        RelationType::PersonStudyAtOrganisation,
        RelationType::PersonWorkAtOrganisation,
        RelationType::PlaceIsPartOfPlace,
        RelationType::TagClassIsSubclassOfTagClass,
    ];

    /// Relationships whose structure drives the partitioning decision by default.
    pub const PARTITION_DEFAULT: [RelationType; 6] = [
        RelationType::OrganisationIsLocatedInPlace,
        RelationType::PersonKnowsPerson,
        RelationType::ForumHasModeratorPerson,
        RelationType::PersonIsLocatedInPlace,
        RelationType::ForumHasTagTag,
        RelationType::TagHasTypeTagClass,
    ];

    /// Entity type of the source endpoint.
    pub const fn from_type(self) -> EntityType {
        use RelationType::*;
        match self {
            OrganisationIsLocatedInPlace => EntityType::Organisation,
            PersonKnowsPerson | PersonIsLocatedInPlace | PersonHasInterestTag
            | PersonStudyAtOrganisation | PersonWorkAtOrganisation => EntityType::Person,
            ForumHasModeratorPerson | ForumHasTagTag | ForumHasMemberPerson => EntityType::Forum,
            TagHasTypeTagClass => EntityType::Tag,
            PlaceIsPartOfPlace => EntityType::Place,
            TagClassIsSubclassOfTagClass => EntityType::TagClass,
        }
    }

    /// Entity type of the target endpoint.
    pub const fn to_type(self) -> EntityType {
        use RelationType::*;
        match self {
            OrganisationIsLocatedInPlace | PersonIsLocatedInPlace | PlaceIsPartOfPlace => {
                EntityType::Place
            }
            PersonKnowsPerson | ForumHasModeratorPerson | ForumHasMemberPerson => {
                EntityType::Person
            }
            ForumHasTagTag | PersonHasInterestTag => EntityType::Tag,
            TagHasTypeTagClass | TagClassIsSubclassOfTagClass => EntityType::TagClass,
            PersonStudyAtOrganisation | PersonWorkAtOrganisation => EntityType::Organisation,
        }
    }

    /// Relationship type name in the graph store.
    pub const fn name(self) -> &'static str {
        use RelationType::*;
        match self {
            OrganisationIsLocatedInPlace | PersonIsLocatedInPlace => "isLocatedIn",
            PersonKnowsPerson => "knows",
            ForumHasModeratorPerson => "hasModerator",
            ForumHasTagTag => "hasTag",
            TagHasTypeTagClass => "hasType",
            ForumHasMemberPerson => "hasMember",
            PersonHasInterestTag => "hasInterest",
            PersonStudyAtOrganisation => "studyAt",
            PersonWorkAtOrganisation => "workAt",
            PlaceIsPartOfPlace => "isPartOf",
            TagClassIsSubclassOfTagClass => "isSubclassOf",
        }
    }

    /// Unique key, `<from>_<name>_<to>`, used in configuration and file names.
    pub const fn key(self) -> &'static str {
        use RelationType::*;
        match self {
            OrganisationIsLocatedInPlace => "organisation_isLocatedIn_place",
            PersonKnowsPerson => "person_knows_person",
            ForumHasModeratorPerson => "forum_hasModerator_person",
            PersonIsLocatedInPlace => "person_isLocatedIn_place",
            ForumHasTagTag => "forum_hasTag_tag",
            TagHasTypeTagClass => "tag_hasType_tagclass",
            ForumHasMemberPerson => "forum_hasMember_person",
            PersonHasInterestTag => "person_hasInterest_tag",
            PersonStudyAtOrganisation => "person_studyAt_organisation",
            PersonWorkAtOrganisation => "person_workAt_organisation",
            PlaceIsPartOfPlace => "place_isPartOf_place",
            TagClassIsSubclassOfTagClass => "tagclass_isSubclassOf_tagclass",
        }
    }

    /// Source file holding this relationship's records.
    pub fn file_name(self) -> String {
        format!("{}_0_0.csv", self.key())
    }

    /// Ordered attribute schema (columns after the two endpoint ids).
    pub const fn schema(self) -> &'static [FieldSpec] {
        const NONE: &[FieldSpec] = &[];
        const KNOWS: &[FieldSpec] = &[date_time("creationDate")];
        const MEMBER: &[FieldSpec] = &[date_time("joinDate")];
        const STUDY: &[FieldSpec] = &[int("classYear")];
        const WORK: &[FieldSpec] = &[int("workFrom")];

        match self {
            RelationType::PersonKnowsPerson => KNOWS,
            RelationType::ForumHasMemberPerson => MEMBER,
            RelationType::PersonStudyAtOrganisation => STUDY,
            RelationType::PersonWorkAtOrganisation => WORK,
            _ => NONE,
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for RelationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim_end_matches("_0_0.csv").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.key().to_ascii_lowercase() == wanted)
            .ok_or_else(|| CoreError::UnknownRelation(s.to_string()))
    }
}

impl Serialize for RelationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for RelationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while interpreting schema-level data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cell did not parse as its schema kind
    #[error("Invalid {kind:?} value for field {field}: {value:?}")]
    InvalidValue {
        field: String,
        kind: FieldKind,
        value: String,
    },

    /// Unknown entity type name
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Unknown relationship type name
    #[error("Unknown relationship type: {0}")]
    UnknownRelation(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// =============================================================================
// Tests
// =============================================================================
