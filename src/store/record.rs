//! Record State and Views
//!
//! A record tracks, per identifier, the current stamp, tombstone status and
//! four association sets: live/deleted metadata prefixes and live/deleted
//! setSpecs. Deleted associations are kept so harvesters of a format or
//! set still observe the deletion event; index membership is therefore the
//! union of live and deleted associations.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::OaiError;
use crate::stamp::{stamp_to_zulu, Stamp};

/// Character that must not occur in a setSpec.
pub const SETSPEC_SEPARATOR: char = ',';

/// Mutable per-identifier state inside the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RecordState {
    pub stamp: Stamp,
    pub tombstone: bool,
    pub prefixes: BTreeSet<String>,
    pub deleted_prefixes: BTreeSet<String>,
    pub sets: BTreeSet<String>,
    pub deleted_sets: BTreeSet<String>,
}

impl RecordState {
    /// Prefixes under which the record is indexed: live or deleted.
    pub fn member_prefixes(&self) -> BTreeSet<String> {
        self.prefixes.union(&self.deleted_prefixes).cloned().collect()
    }

    /// Sets under which the record is indexed: live or deleted.
    pub fn member_sets(&self) -> BTreeSet<String> {
        self.sets.union(&self.deleted_sets).cloned().collect()
    }

    pub fn to_entry(&self, identifier: &str) -> RecordEntry {
        RecordEntry {
            identifier: identifier.to_string(),
            timestamp: self.stamp,
            tombstone: self.tombstone,
            prefixes: self.prefixes.iter().cloned().collect(),
            deleted_prefixes: self.deleted_prefixes.iter().cloned().collect(),
            sets: self.sets.iter().cloned().collect(),
            deleted_sets: self.deleted_sets.iter().cloned().collect(),
        }
    }

    pub fn from_entry(entry: &RecordEntry) -> Self {
        RecordState {
            stamp: entry.timestamp,
            tombstone: entry.tombstone,
            prefixes: entry.prefixes.iter().cloned().collect(),
            deleted_prefixes: entry.deleted_prefixes.iter().cloned().collect(),
            sets: entry.sets.iter().cloned().collect(),
            deleted_sets: entry.deleted_sets.iter().cloned().collect(),
        }
    }
}

/// Serialized record form, shared by the record log and the dump format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub identifier: String,
    pub timestamp: Stamp,
    pub tombstone: bool,
    pub prefixes: Vec<String>,
    #[serde(rename = "deletedPrefixes")]
    pub deleted_prefixes: Vec<String>,
    pub sets: Vec<String>,
    #[serde(rename = "deletedSets")]
    pub deleted_sets: Vec<String>,
}

/// Read-only record view returned by `get_record` and `oai_select`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiRecord {
    pub identifier: String,
    pub stamp: Stamp,
    pub tombstone: bool,
    pub prefixes: Vec<String>,
    pub deleted_prefixes: Vec<String>,
    pub sets: Vec<String>,
    pub deleted_sets: Vec<String>,
}

impl OaiRecord {
    /// Fully deleted (tombstoned).
    pub fn is_deleted(&self) -> bool {
        self.tombstone
    }

    /// Deleted from the perspective of a harvester of `prefix`.
    pub fn is_deleted_in_prefix(&self, prefix: &str) -> bool {
        self.tombstone
            || (self.deleted_prefixes.iter().any(|p| p == prefix)
                && !self.prefixes.iter().any(|p| p == prefix))
    }

    /// Deleted from the perspective of a harvester of `set_spec`.
    pub fn is_deleted_in_set(&self, set_spec: &str) -> bool {
        self.tombstone
            || (self.deleted_sets.iter().any(|s| s == set_spec)
                && !self.sets.iter().any(|s| s == set_spec))
    }

    pub fn datestamp(&self, precise: bool) -> String {
        stamp_to_zulu(self.stamp, precise)
    }
}

/// Flatten a set hierarchy: `["a:b:c"]` implies `{"a", "a:b", "a:b:c"}`.
pub fn flatten_set_hierarchy<'a>(specs: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut flattened = BTreeSet::new();
    for spec in specs {
        let parts: Vec<&str> = spec.split(':').collect();
        for depth in 1..=parts.len() {
            flattened.insert(parts[..depth].join(":"));
        }
    }
    flattened
}

pub(crate) fn validate_set_spec(spec: &str) -> Result<(), OaiError> {
    if spec.is_empty() {
        return Err(OaiError::InvalidArgument("empty setSpec not allowed".to_string()));
    }
    if spec.contains(SETSPEC_SEPARATOR) {
        return Err(OaiError::InvalidArgument(format!(
            "setSpec {:?} contains illegal character {:?}",
            spec, SETSPEC_SEPARATOR
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_set_hierarchy() {
        let flattened = flatten_set_hierarchy(["1:2:3", "1:2:4"]);
        let expected: BTreeSet<String> = ["1", "1:2", "1:2:3", "1:2:4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn test_member_sets_union_live_and_deleted() {
        let mut state = RecordState::default();
        state.sets.insert("a".to_string());
        state.deleted_sets.insert("b".to_string());
        let members: Vec<String> = state.member_sets().into_iter().collect();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_entry_round_trip() {
        let mut state = RecordState {
            stamp: 42,
            tombstone: true,
            ..RecordState::default()
        };
        state.prefixes.insert("oai_dc".to_string());
        state.deleted_sets.insert("x:y".to_string());

        let entry = state.to_entry("rec:1");
        assert_eq!(entry.identifier, "rec:1");
        assert_eq!(RecordState::from_entry(&entry), state);
    }

    #[test]
    fn test_deleted_in_prefix_view() {
        let record = OaiRecord {
            identifier: "rec:1".to_string(),
            stamp: 1,
            tombstone: false,
            prefixes: vec!["kept".to_string()],
            deleted_prefixes: vec!["gone".to_string()],
            sets: vec![],
            deleted_sets: vec![],
        };
        assert!(!record.is_deleted());
        assert!(record.is_deleted_in_prefix("gone"));
        assert!(!record.is_deleted_in_prefix("kept"));
    }

    #[test]
    fn test_validate_set_spec() {
        assert!(validate_set_spec("a:b").is_ok());
        assert!(validate_set_spec("").is_err());
        assert!(validate_set_spec("a,b").is_err());
    }
}
