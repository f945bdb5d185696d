//! Indexing and change-tracking core of an OAI-PMH repository: a record
//! store with per-prefix/per-set posting-list indices, monotonic stamp
//! allocation, tombstone tracking, resumption-token pagination,
//! consistent-hash partitioning and a suspend register for long-polling
//! harvesters.

pub mod config;
pub mod error;
pub mod partition;
pub mod stamp;
pub mod store;
pub mod suspend;
pub mod token;

pub use config::StoreConfig;
pub use error::OaiError;
pub use partition::Partition;
pub use stamp::{Stamp, StampAllocator, DATESTAMP_FACTOR};
pub use store::{OaiJazz, OaiRecord, RecordCounts, SelectQuery, SelectResult};
pub use suspend::{ForcedResume, SuspendRegister, SuspendedRequest};
pub use token::ResumptionToken;
