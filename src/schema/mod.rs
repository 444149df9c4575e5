//! Table schema: locality groups and column-family options.
//!
//! A table's schema names its **locality groups** — disjoint sets of
//! column families that share one LSM engine per tablet — and the
//! per-family retention options. The schema is mutable in place: an
//! `update_schema` control call swaps the engine-visible settings without
//! reopening anything.

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::engine::compaction::StrategyKind;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Schema validation failures; surfaced to the master as `IllegalAccess`.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A table without locality groups cannot be loaded.
    #[error("schema has no locality groups")]
    NoLocalityGroups,

    /// Locality-group names must be unique.
    #[error("duplicate locality group {0:?}")]
    DuplicateGroup(String),

    /// A column family may belong to exactly one group.
    #[error("column family {0:?} appears in more than one group")]
    DuplicateFamily(String),

    /// A group with no families stores nothing.
    #[error("locality group {0:?} has no column families")]
    EmptyGroup(String),
}

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Retention and storage options of one column family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilySchema {
    /// Family name, unique across the table.
    pub name: String,

    /// Cell versions kept per `(row, qualifier)` (0 = unlimited).
    pub max_versions: u32,

    /// Cell time-to-live in microseconds (0 = keep forever).
    pub ttl_micros: u64,
}

impl ColumnFamilySchema {
    /// A family with unlimited versions and no TTL.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_versions: 0,
            ttl_micros: 0,
        }
    }
}

/// One locality group: co-stored families backed by a dedicated engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityGroup {
    /// Group name; becomes the engine directory component.
    pub name: String,

    /// Families stored in this group.
    pub families: Vec<ColumnFamilySchema>,

    /// Compression algorithm id for this group's tables (0 = none).
    pub compression_id: u8,

    /// Bloom filters on this group's tables.
    pub bloom: bool,

    /// Compaction strategy family for this group's engine.
    pub strategy: StrategyKind,
}

impl LocalityGroup {
    /// A group with default storage options.
    pub fn new(name: impl Into<String>, families: Vec<ColumnFamilySchema>) -> Self {
        Self {
            name: name.into(),
            families,
            compression_id: 0,
            bloom: true,
            strategy: StrategyKind::CheckTag,
        }
    }

    /// The strictest (smallest nonzero) TTL among the group's families;
    /// the engine applies it group-wide.
    pub fn effective_ttl_micros(&self) -> u64 {
        self.families
            .iter()
            .map(|f| f.ttl_micros)
            .filter(|&ttl| ttl != 0)
            .min()
            .unwrap_or(0)
    }

    /// The largest version cap among the group's families (0 = unlimited
    /// anywhere).
    pub fn effective_max_versions(&self) -> u32 {
        let caps: Vec<u32> = self.families.iter().map(|f| f.max_versions).collect();
        if caps.iter().any(|&cap| cap == 0) {
            0
        } else {
            caps.into_iter().max().unwrap_or(0)
        }
    }
}

/// A table's full schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    /// Table name.
    pub table: String,

    /// Locality groups, each one engine per tablet.
    pub groups: Vec<LocalityGroup>,
}

impl Schema {
    /// A one-group schema, the common case in tests and small tables.
    pub fn single_group(group: &str, families: &[&str]) -> Self {
        Self {
            table: String::new(),
            groups: vec![LocalityGroup::new(
                group,
                families
                    .iter()
                    .map(|name| ColumnFamilySchema::new(*name))
                    .collect(),
            )],
        }
    }

    /// Check the structural invariants a loadable schema must satisfy.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.groups.is_empty() {
            return Err(SchemaError::NoLocalityGroups);
        }

        let mut group_names = std::collections::HashSet::new();
        let mut family_names = std::collections::HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.clone()) {
                return Err(SchemaError::DuplicateGroup(group.name.clone()));
            }
            if group.families.is_empty() {
                return Err(SchemaError::EmptyGroup(group.name.clone()));
            }
            for family in &group.families {
                if !family_names.insert(family.name.clone()) {
                    return Err(SchemaError::DuplicateFamily(family.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// The group storing `family`, if any.
    pub fn group_of_family(&self, family: &str) -> Option<&LocalityGroup> {
        self.groups
            .iter()
            .find(|group| group.families.iter().any(|f| f.name == family))
    }

    /// The group named `name`, if any.
    pub fn group(&self, name: &str) -> Option<&LocalityGroup> {
        self.groups.iter().find(|group| group.name == name)
    }
}
