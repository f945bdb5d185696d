//! Index Storage Backends
//!
//! Durable layout of one store directory:
//!
//! ```text
//! <dir>/oai.version          format version gate ("1")
//! <dir>/catalog.json         metadata catalog, atomic tmp+rename updates
//! <dir>/records.log          append-only record log (source of truth)
//! <dir>/lists/p_<hex>.lst    per-prefix posting-list op log
//! <dir>/lists/s_<hex>.lst    per-set posting-list op log
//! <dir>/lists/tombstones.lst global tombstone op log
//! ```
//!
//! ## Log File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (8 bytes)                 │
//! │ - magic: "OREC" / "OPLG"         │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! ├──────────────────────────────────┤
//! │ Entry 0                          │
//! │ - payload_length: u32 LE         │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - payload                        │
//! ├──────────────────────────────────┤
//! │ Entry 1 ...                      │
//! └──────────────────────────────────┘
//! ```
//!
//! Record-log payloads are bincode (`RecordLogOp`); list payloads are a
//! fixed 9-byte `[tag][stamp u64 LE]` (tag 1 = insert, 0 = remove).
//! Readers stop at the first truncated or corrupted entry, recovering all
//! fully-written entries before the crash point.
//!
//! ## Implementations
//!
//! - `MemoryStorage`: for unit tests
//! - `FsStorage`: production (std::fs, fsync on `sync`)

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Error as IoError, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::stamp::Stamp;
use crate::store::catalog::Catalog;
use crate::store::record::RecordEntry;

/// On-disk format version; a differing `oai.version` refuses to open.
pub const FORMAT_VERSION: &str = "1";

const VERSION_FILE: &str = "oai.version";
const CATALOG_FILE: &str = "catalog.json";
const RECORD_LOG_FILE: &str = "records.log";
const LISTS_DIR: &str = "lists";

const RECORD_LOG_MAGIC: [u8; 4] = *b"OREC";
const LIST_MAGIC: [u8; 4] = *b"OPLG";
const LOG_VERSION: u8 = 1;
/// Header size in bytes
const FILE_HEADER_SIZE: usize = 8;
/// Entry overhead: payload_length(4) + checksum(4)
const ENTRY_OVERHEAD: usize = 8;

const LIST_OP_REMOVE: u8 = 0;
const LIST_OP_INSERT: u8 = 1;
const LIST_OP_SIZE: usize = 9;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    /// I/O error
    Io(IoError),
    /// Corruption detected (bad magic, undecodable payload)
    Corruption(String),
    /// On-disk format version differs from what this code expects
    VersionMismatch { found: String },
    /// Serialization error
    Serialization(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {}", e),
            StorageError::Corruption(msg) => write!(f, "corruption: {}", msg),
            StorageError::VersionMismatch { found } => {
                write!(
                    f,
                    "store format version {} found, expected {}; convert the store before opening it",
                    found, FORMAT_VERSION
                )
            }
            StorageError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<IoError> for StorageError {
    fn from(e: IoError) -> Self {
        StorageError::Io(e)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Addresses one durable posting list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListKey {
    Prefix(String),
    Set(String),
    Tombstones,
}

impl ListKey {
    fn file_name(&self) -> String {
        match self {
            ListKey::Prefix(name) => format!("p_{}.lst", hex_name(name)),
            ListKey::Set(name) => format!("s_{}.lst", hex_name(name)),
            ListKey::Tombstones => "tombstones.lst".to_string(),
        }
    }
}

// List names land in filenames; hex keeps arbitrary prefix/set bytes safe.
fn hex_name(name: &str) -> String {
    let mut hex = String::with_capacity(name.len() * 2);
    for byte in name.bytes() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// One record-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordLogOp {
    Upsert(RecordEntry),
    Purge(String),
}

/// One posting-list op-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOp {
    Insert(Stamp),
    Remove(Stamp),
}

impl ListOp {
    fn encode(&self) -> [u8; LIST_OP_SIZE] {
        let (tag, stamp) = match self {
            ListOp::Insert(stamp) => (LIST_OP_INSERT, *stamp),
            ListOp::Remove(stamp) => (LIST_OP_REMOVE, *stamp),
        };
        let mut buf = [0u8; LIST_OP_SIZE];
        buf[0] = tag;
        buf[1..].copy_from_slice(&stamp.to_le_bytes());
        buf
    }

    fn decode(payload: &[u8]) -> Result<Self, StorageError> {
        if payload.len() != LIST_OP_SIZE {
            return Err(StorageError::Corruption(format!(
                "list op payload of {} bytes",
                payload.len()
            )));
        }
        let stamp = Stamp::from_le_bytes(payload[1..].try_into().expect("9-byte payload"));
        match payload[0] {
            LIST_OP_INSERT => Ok(ListOp::Insert(stamp)),
            LIST_OP_REMOVE => Ok(ListOp::Remove(stamp)),
            tag => Err(StorageError::Corruption(format!("unknown list op tag {}", tag))),
        }
    }
}

/// Storage backend for one store instance.
pub trait IndexStorage: Send {
    fn load_catalog(&mut self) -> Result<Option<Catalog>, StorageError>;
    fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), StorageError>;

    fn load_record_log(&mut self) -> Result<Vec<RecordLogOp>, StorageError>;
    fn append_record(&mut self, op: &RecordLogOp) -> Result<(), StorageError>;
    fn rewrite_record_log(&mut self, ops: &[RecordLogOp]) -> Result<(), StorageError>;

    /// `None` when the list was never written.
    fn load_list(&mut self, key: &ListKey) -> Result<Option<Vec<ListOp>>, StorageError>;
    fn append_list_ops(&mut self, key: &ListKey, ops: &[ListOp]) -> Result<(), StorageError>;
    /// Replace a list file with plain inserts of `stamps` (compaction/rebuild).
    fn rewrite_list(&mut self, key: &ListKey, stamps: &[Stamp]) -> Result<(), StorageError>;

    /// Flush everything to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;
}

// ============================================================================
// MemoryStorage - for unit tests
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    catalog: Option<Catalog>,
    record_log: Vec<RecordLogOp>,
    lists: HashMap<ListKey, Vec<ListOp>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl IndexStorage for MemoryStorage {
    fn load_catalog(&mut self) -> Result<Option<Catalog>, StorageError> {
        Ok(self.catalog.clone())
    }

    fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), StorageError> {
        self.catalog = Some(catalog.clone());
        Ok(())
    }

    fn load_record_log(&mut self) -> Result<Vec<RecordLogOp>, StorageError> {
        Ok(self.record_log.clone())
    }

    fn append_record(&mut self, op: &RecordLogOp) -> Result<(), StorageError> {
        self.record_log.push(op.clone());
        Ok(())
    }

    fn rewrite_record_log(&mut self, ops: &[RecordLogOp]) -> Result<(), StorageError> {
        self.record_log = ops.to_vec();
        Ok(())
    }

    fn load_list(&mut self, key: &ListKey) -> Result<Option<Vec<ListOp>>, StorageError> {
        Ok(self.lists.get(key).cloned())
    }

    fn append_list_ops(&mut self, key: &ListKey, ops: &[ListOp]) -> Result<(), StorageError> {
        self.lists.entry(key.clone()).or_default().extend_from_slice(ops);
        Ok(())
    }

    fn rewrite_list(&mut self, key: &ListKey, stamps: &[Stamp]) -> Result<(), StorageError> {
        self.lists
            .insert(key.clone(), stamps.iter().map(|&s| ListOp::Insert(s)).collect());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// FsStorage - production
// ============================================================================

pub struct FsStorage {
    dir: PathBuf,
    record_writer: Option<BufWriter<File>>,
    list_writers: HashMap<ListKey, BufWriter<File>>,
}

impl FsStorage {
    /// Open or initialize a store directory. A non-empty directory with a
    /// missing or different version file refuses to open.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        check_version(&dir)?;
        fs::create_dir_all(dir.join(LISTS_DIR))?;
        Ok(FsStorage {
            dir,
            record_writer: None,
            list_writers: HashMap::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn record_log_path(&self) -> PathBuf {
        self.dir.join(RECORD_LOG_FILE)
    }

    fn list_path(&self, key: &ListKey) -> PathBuf {
        self.dir.join(LISTS_DIR).join(key.file_name())
    }
}

fn check_version(dir: &Path) -> Result<(), StorageError> {
    let version_path = dir.join(VERSION_FILE);
    if version_path.is_file() {
        let found = fs::read_to_string(&version_path)?;
        if found.trim() != FORMAT_VERSION {
            return Err(StorageError::VersionMismatch {
                found: found.trim().to_string(),
            });
        }
        return Ok(());
    }
    if fs::read_dir(dir)?.next().is_some() {
        return Err(StorageError::VersionMismatch {
            found: "missing".to_string(),
        });
    }
    fs::write(&version_path, FORMAT_VERSION)?;
    Ok(())
}

fn file_header(magic: [u8; 4]) -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..4].copy_from_slice(&magic);
    header[4] = LOG_VERSION;
    header
}

fn encode_entry(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENTRY_OVERHEAD + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a log file into entry payloads. Stops at the first truncated or
/// corrupt entry; a file too short for its header reads as empty.
fn decode_entries(data: &[u8], magic: [u8; 4]) -> Result<Vec<&[u8]>, StorageError> {
    if data.len() < FILE_HEADER_SIZE {
        return Ok(Vec::new());
    }
    if data[..4] != magic {
        return Err(StorageError::Corruption("bad log file magic".to_string()));
    }
    if data[4] != LOG_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported log version {}",
            data[4]
        )));
    }

    let mut entries = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while data.len() >= offset + ENTRY_OVERHEAD {
        let length =
            u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4 bytes")) as usize;
        let checksum =
            u32::from_le_bytes(data[offset + 4..offset + 8].try_into().expect("4 bytes"));
        let Some(end) = offset.checked_add(ENTRY_OVERHEAD + length) else {
            break;
        };
        if data.len() < end {
            break; // truncated entry
        }
        let payload = &data[offset + ENTRY_OVERHEAD..end];
        if crc32fast::hash(payload) != checksum {
            break; // corrupted entry
        }
        entries.push(payload);
        offset = end;
    }
    Ok(entries)
}

fn open_log_writer(path: &Path, magic: [u8; 4]) -> Result<BufWriter<File>, StorageError> {
    let needs_header = match fs::metadata(path) {
        Ok(meta) if meta.len() >= FILE_HEADER_SIZE as u64 => false,
        Ok(_) => {
            // Crash left a partial header; start the file over.
            fs::remove_file(path)?;
            true
        }
        Err(_) => true,
    };
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    if needs_header {
        writer.write_all(&file_header(magic))?;
        writer.flush()?;
    }
    Ok(writer)
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl IndexStorage for FsStorage {
    fn load_catalog(&mut self) -> Result<Option<Catalog>, StorageError> {
        let path = self.dir.join(CATALOG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let catalog = serde_json::from_str(&contents)
            .map_err(|e| StorageError::Serialization(format!("catalog: {}", e)))?;
        Ok(Some(catalog))
    }

    fn save_catalog(&mut self, catalog: &Catalog) -> Result<(), StorageError> {
        let contents = serde_json::to_vec_pretty(catalog)
            .map_err(|e| StorageError::Serialization(format!("catalog: {}", e)))?;
        atomic_write(&self.dir.join(CATALOG_FILE), &contents)
    }

    fn load_record_log(&mut self) -> Result<Vec<RecordLogOp>, StorageError> {
        let path = self.record_log_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)?;
        let mut ops = Vec::new();
        for payload in decode_entries(&data, RECORD_LOG_MAGIC)? {
            ops.push(bincode::deserialize(payload)?);
        }
        Ok(ops)
    }

    fn append_record(&mut self, op: &RecordLogOp) -> Result<(), StorageError> {
        if self.record_writer.is_none() {
            self.record_writer = Some(open_log_writer(&self.record_log_path(), RECORD_LOG_MAGIC)?);
        }
        let writer = self.record_writer.as_mut().expect("writer just opened");
        let payload = bincode::serialize(op)?;
        writer.write_all(&encode_entry(&payload))?;
        writer.flush()?;
        Ok(())
    }

    fn rewrite_record_log(&mut self, ops: &[RecordLogOp]) -> Result<(), StorageError> {
        self.record_writer = None;
        let mut contents = file_header(RECORD_LOG_MAGIC).to_vec();
        for op in ops {
            let payload = bincode::serialize(op)?;
            contents.extend_from_slice(&encode_entry(&payload));
        }
        atomic_write(&self.record_log_path(), &contents)
    }

    fn load_list(&mut self, key: &ListKey) -> Result<Option<Vec<ListOp>>, StorageError> {
        let path = self.list_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        let mut ops = Vec::new();
        for payload in decode_entries(&data, LIST_MAGIC)? {
            ops.push(ListOp::decode(payload)?);
        }
        Ok(Some(ops))
    }

    fn append_list_ops(&mut self, key: &ListKey, ops: &[ListOp]) -> Result<(), StorageError> {
        if !self.list_writers.contains_key(key) {
            let writer = open_log_writer(&self.list_path(key), LIST_MAGIC)?;
            self.list_writers.insert(key.clone(), writer);
        }
        let writer = self.list_writers.get_mut(key).expect("writer just opened");
        for op in ops {
            writer.write_all(&encode_entry(&op.encode()))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn rewrite_list(&mut self, key: &ListKey, stamps: &[Stamp]) -> Result<(), StorageError> {
        self.list_writers.remove(key);
        let mut contents = file_header(LIST_MAGIC).to_vec();
        for &stamp in stamps {
            contents.extend_from_slice(&encode_entry(&ListOp::Insert(stamp).encode()));
        }
        atomic_write(&self.list_path(key), &contents)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        if let Some(writer) = self.record_writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        for writer in self.list_writers.values_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}
