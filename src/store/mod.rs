mod backend;
mod catalog;
mod export;
mod jazz;
mod posting;
mod record;

pub use backend::{
    FsStorage, IndexStorage, ListKey, ListOp, MemoryStorage, RecordLogOp, StorageError,
    FORMAT_VERSION,
};
pub use catalog::{Catalog, FormatDescriptor, MetadataFormat};
pub use export::EXPORT_VERSION;
pub use jazz::{OaiJazz, RecordCounts, SelectQuery, SelectResult};
pub use posting::{intersect_sorted, union_sorted, PostingList};
pub use record::{flatten_set_hierarchy, OaiRecord, RecordEntry, SETSPEC_SEPARATOR};
