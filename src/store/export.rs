//! Dump and Restore
//!
//! Line-oriented dump of a whole store, used to rebuild one from scratch:
//!
//! ```text
//! META:
//! {"export_version":1,"metadataPrefixes":{...},"sets":{...}}
//! RECORDS:
//! {"identifier":...,"timestamp":...,"tombstone":...,...}
//! ...
//! ```
//!
//! Records are emitted in ascending stamp order and imported with their
//! literal stamps, so a restored store reproduces `oai_select` results
//! bit-for-bit relative to the source store's final state.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::OaiError;
use crate::store::backend::{IndexStorage, StorageError};
use crate::store::catalog::FormatDescriptor;
use crate::store::jazz::OaiJazz;
use crate::store::record::{RecordEntry, RecordState};

/// Version of the dump format itself.
pub const EXPORT_VERSION: u32 = 1;

const META_MARKER: &str = "META:";
const RECORDS_MARKER: &str = "RECORDS:";

#[derive(Debug, Serialize, Deserialize)]
struct DumpMeta {
    export_version: u32,
    #[serde(rename = "metadataPrefixes")]
    metadata_prefixes: BTreeMap<String, FormatDescriptor>,
    sets: BTreeMap<String, DumpSetName>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpSetName {
    #[serde(rename = "setName")]
    set_name: String,
}

fn io_error(e: std::io::Error) -> OaiError {
    OaiError::Storage(StorageError::Io(e))
}

fn bad_dump(msg: impl std::fmt::Display) -> OaiError {
    OaiError::InvalidArgument(format!("dump: {}", msg))
}

impl OaiJazz {
    /// Write the catalog and every record (stamp order) as a dump.
    pub fn export_dump<W: Write>(&self, mut writer: W) -> Result<(), OaiError> {
        let meta = DumpMeta {
            export_version: EXPORT_VERSION,
            metadata_prefixes: self.catalog().prefixes.clone(),
            sets: self
                .catalog()
                .sets
                .iter()
                .map(|(set_spec, set_name)| {
                    (set_spec.clone(), DumpSetName { set_name: set_name.clone() })
                })
                .collect(),
        };
        writeln!(writer, "{}", META_MARKER).map_err(io_error)?;
        serde_json::to_writer(&mut writer, &meta)
            .map_err(|e| OaiError::Storage(StorageError::Serialization(e.to_string())))?;
        writeln!(writer).map_err(io_error)?;
        writeln!(writer, "{}", RECORDS_MARKER).map_err(io_error)?;
        for (identifier, state) in self.records_in_stamp_order() {
            serde_json::to_writer(&mut writer, &state.to_entry(identifier))
                .map_err(|e| OaiError::Storage(StorageError::Serialization(e.to_string())))?;
            writeln!(writer).map_err(io_error)?;
        }
        Ok(())
    }

    /// Rebuild a store from a dump. The backing storage must be empty;
    /// stamps are applied literally and must be ascending.
    pub fn import_dump<R: BufRead>(
        reader: R,
        storage: Box<dyn IndexStorage>,
        config: StoreConfig,
    ) -> Result<OaiJazz, OaiError> {
        let mut jazz = OaiJazz::with_storage(storage, config)?;
        if jazz.total_records() > 0 || !jazz.all_prefixes().is_empty() {
            return Err(OaiError::InvalidArgument(
                "import requires an empty store".to_string(),
            ));
        }

        let mut lines = reader.lines();
        if next_line(&mut lines)? != META_MARKER {
            return Err(bad_dump("missing META: section"));
        }
        let meta: DumpMeta = serde_json::from_str(&next_line(&mut lines)?)
            .map_err(|e| bad_dump(format_args!("metadata header: {}", e)))?;
        if meta.export_version != EXPORT_VERSION {
            return Err(bad_dump(format_args!(
                "unsupported export version {}",
                meta.export_version
            )));
        }
        if next_line(&mut lines)? != RECORDS_MARKER {
            return Err(bad_dump("missing RECORDS: section"));
        }

        for (prefix, descriptor) in &meta.metadata_prefixes {
            jazz.register_metadata_format(prefix, &descriptor.schema, &descriptor.namespace)?;
        }
        for (set_spec, name) in &meta.sets {
            jazz.register_set(set_spec, &name.set_name)?;
        }

        for line in lines {
            let line = line.map_err(io_error)?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: RecordEntry = serde_json::from_str(&line)
                .map_err(|e| bad_dump(format_args!("record line: {}", e)))?;
            let identifier = entry.identifier.clone();
            jazz.apply_imported(&identifier, RecordState::from_entry(&entry))?;
        }
        jazz.commit()?;
        Ok(jazz)
    }
}

fn next_line<B: BufRead>(lines: &mut std::io::Lines<B>) -> Result<String, OaiError> {
    match lines.next() {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(io_error(e)),
        None => Err(bad_dump("unexpected end of dump")),
    }
}
