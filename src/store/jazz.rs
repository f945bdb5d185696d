//! The Record Store
//!
//! `OaiJazz` owns the identifier↔stamp mapping, per-record prefix/set
//! association state, the metadata catalog and the posting-list indices,
//! and serves the add/delete/select API. Mutations are logically
//! single-writer (`&mut self`): each one allocates a fresh stamp, moves
//! the record's index entries from the old stamp to the new one as an
//! atomic unit (with rollback on an ordering violation), appends to the
//! durable logs and signals the suspend register.
//!
//! Deletion is visibility-preserving: a tombstoned record keeps appearing
//! in every prefix/set listing it ever belonged to. `purge` is the only
//! true destructor and is reserved for maintenance.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::OaiError;
use crate::partition::Partition;
use crate::stamp::{from_time, stamp_to_zulu, until_time, Stamp, StampAllocator, StampClock};
use crate::store::backend::{
    FsStorage, IndexStorage, ListKey, ListOp, MemoryStorage, RecordLogOp, StorageError,
};
use crate::store::catalog::{Catalog, MetadataFormat};
use crate::store::posting::{intersect_sorted, union_sorted, PostingList};
use crate::store::record::{flatten_set_hierarchy, validate_set_spec, OaiRecord, RecordState};
use crate::suspend::SuspendRegister;
use crate::token::ResumptionToken;

/// Selective, paginated, time-ranged query over the store.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub prefix: String,
    /// Match records in any of these sets (empty: no set restriction)
    pub sets: Vec<String>,
    /// Resume strictly after this stamp (0: from the beginning)
    pub continue_after: Stamp,
    /// Zulu datestamp lower bound, inclusive
    pub from: Option<String>,
    /// Zulu datestamp upper bound, inclusive (whole second)
    pub until: Option<String>,
    /// 0 falls back to the store's configured default
    pub batch_size: usize,
    pub partition: Option<Partition>,
    /// Also count the records remaining beyond the returned batch
    pub should_count_hits: bool,
}

impl SelectQuery {
    pub fn new(prefix: impl Into<String>) -> Self {
        SelectQuery {
            prefix: prefix.into(),
            ..SelectQuery::default()
        }
    }

    /// Reconstruct the continuation of a paginated request. The token
    /// carries at most one set, as OAI-PMH requests do.
    pub fn from_token(token: &ResumptionToken) -> Self {
        SelectQuery {
            prefix: token.metadata_prefix.clone(),
            sets: if token.set_spec.is_empty() {
                Vec::new()
            } else {
                vec![token.set_spec.clone()]
            },
            continue_after: token.continue_after,
            from: (!token.from.is_empty()).then(|| token.from.clone()),
            until: (!token.until.is_empty()).then(|| token.until.clone()),
            batch_size: 0,
            partition: token.partition.clone(),
            should_count_hits: false,
        }
    }

    /// Token for the next page of this query.
    pub fn resumption_token(&self, continue_after: Stamp) -> ResumptionToken {
        ResumptionToken {
            metadata_prefix: self.prefix.clone(),
            continue_after,
            from: self.from.clone().unwrap_or_default(),
            until: self.until.clone().unwrap_or_default(),
            set_spec: self.sets.first().cloned().unwrap_or_default(),
            partition: self.partition.clone(),
        }
    }
}

/// One page of select results.
#[derive(Debug, Clone)]
pub struct SelectResult {
    /// Matching records in ascending stamp order
    pub records: Vec<OaiRecord>,
    pub more_records_available: bool,
    /// Stamp of the last returned record, the next page's cursor
    pub continue_after: Stamp,
    /// Matches beyond this batch, when the query asked for a count
    pub records_remaining: Option<u64>,
}

/// Per-prefix record totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub total: u64,
    pub deletes: u64,
}

pub struct OaiJazz {
    storage: Box<dyn IndexStorage>,
    config: StoreConfig,
    catalog: Catalog,
    catalog_dirty: bool,
    records: AHashMap<String, RecordState>,
    /// Live stamps only; bijective with `records`
    stamp_index: BTreeMap<Stamp, String>,
    lists: BTreeMap<ListKey, PostingList>,
    allocator: StampAllocator,
    register: Arc<SuspendRegister>,
    record_log_entries: u64,
}

impl OaiJazz {
    /// Open (or initialize) a store directory.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self, OaiError> {
        Self::load(
            Box::new(FsStorage::open(dir)?),
            config,
            StampAllocator::system(),
        )
    }

    /// Store over an explicit backend, e.g. `MemoryStorage` in tests.
    pub fn with_storage(
        storage: Box<dyn IndexStorage>,
        config: StoreConfig,
    ) -> Result<Self, OaiError> {
        Self::load(storage, config, StampAllocator::system())
    }

    /// Store over an explicit backend and clock.
    pub fn with_storage_and_clock(
        storage: Box<dyn IndexStorage>,
        config: StoreConfig,
        clock: Box<dyn StampClock>,
    ) -> Result<Self, OaiError> {
        Self::load(storage, config, StampAllocator::new(clock))
    }

    /// Volatile store for tests.
    pub fn in_memory(config: StoreConfig) -> Result<Self, OaiError> {
        Self::with_storage(Box::new(MemoryStorage::new()), config)
    }

    fn load(
        mut storage: Box<dyn IndexStorage>,
        config: StoreConfig,
        mut allocator: StampAllocator,
    ) -> Result<Self, OaiError> {
        let mut catalog = storage.load_catalog()?.unwrap_or_default();

        let log_ops = storage.load_record_log()?;
        let mut record_log_entries = log_ops.len() as u64;
        let mut records: AHashMap<String, RecordState> = AHashMap::new();
        for op in &log_ops {
            match op {
                RecordLogOp::Upsert(entry) => {
                    records.insert(entry.identifier.clone(), RecordState::from_entry(entry));
                }
                RecordLogOp::Purge(identifier) => {
                    records.remove(identifier);
                }
            }
        }

        let mut stamp_index: BTreeMap<Stamp, String> = BTreeMap::new();
        for (identifier, state) in &records {
            allocator.observe(state.stamp);
            if let Some(other) = stamp_index.insert(state.stamp, identifier.clone()) {
                return Err(StorageError::Corruption(format!(
                    "stamp {} held by both {} and {}",
                    state.stamp, other, identifier
                ))
                .into());
            }
        }

        // The record log is the source of truth: derive every list's
        // expected content in ascending stamp order.
        let mut expected: BTreeMap<ListKey, Vec<Stamp>> = BTreeMap::new();
        for prefix in catalog.prefixes.keys() {
            expected.entry(ListKey::Prefix(prefix.clone())).or_default();
        }
        for set_spec in catalog.sets.keys() {
            expected.entry(ListKey::Set(set_spec.clone())).or_default();
        }
        expected.entry(ListKey::Tombstones).or_default();
        for (stamp, identifier) in &stamp_index {
            let state = &records[identifier];
            for prefix in state.member_prefixes() {
                expected.entry(ListKey::Prefix(prefix)).or_default().push(*stamp);
            }
            for set_spec in state.member_sets() {
                expected.entry(ListKey::Set(set_spec)).or_default().push(*stamp);
            }
            if state.tombstone {
                expected.entry(ListKey::Tombstones).or_default().push(*stamp);
            }
        }

        // Records can reference names the catalog never saw when a crash
        // hit between log appends; re-register them with empty descriptors.
        let mut catalog_dirty = false;
        for key in expected.keys() {
            match key {
                ListKey::Prefix(prefix) => catalog_dirty |= catalog.ensure_prefix(prefix),
                ListKey::Set(set_spec) => catalog_dirty |= catalog.ensure_set(set_spec),
                ListKey::Tombstones => {}
            }
        }

        let mut lists: BTreeMap<ListKey, PostingList> = BTreeMap::new();
        for (key, stamps) in expected {
            let loaded = storage.load_list(&key)?;
            let op_count = loaded.as_ref().map_or(0, Vec::len);
            let replayed = loaded.map(|ops| replay_list_ops(&ops));
            if replayed.as_deref() != Some(stamps.as_slice()) {
                debug!("rebuilding posting list {:?}", key);
                storage.rewrite_list(&key, &stamps)?;
            } else if op_count > stamps.len() * 2 + 64 {
                // Op log dominated by removals; rewrite it as plain inserts.
                debug!("compacting posting list {:?}", key);
                storage.rewrite_list(&key, &stamps)?;
            }
            lists.insert(key, PostingList::from_sorted(stamps));
        }

        // Compact a record log that outgrew its live content.
        if record_log_entries > records.len() as u64 * 2 + 64 {
            let compacted: Vec<RecordLogOp> = stamp_index
                .values()
                .map(|identifier| RecordLogOp::Upsert(records[identifier].to_entry(identifier)))
                .collect();
            info!(
                "compacting record log: {} entries down to {}",
                record_log_entries,
                compacted.len()
            );
            storage.rewrite_record_log(&compacted)?;
            record_log_entries = compacted.len() as u64;
        }

        let register = Arc::new(SuspendRegister::new(config.max_suspended_connections));
        Ok(OaiJazz {
            storage,
            config,
            catalog,
            catalog_dirty,
            records,
            stamp_index,
            lists,
            allocator,
            register,
            record_log_entries,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The long-poll registry tied to this store instance.
    pub fn suspend_register(&self) -> Arc<SuspendRegister> {
        self.register.clone()
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Idempotent upsert of a metadata format.
    pub fn register_metadata_format(
        &mut self,
        prefix: &str,
        schema: &str,
        namespace: &str,
    ) -> Result<(), OaiError> {
        if prefix.is_empty() {
            return Err(OaiError::InvalidArgument(
                "empty metadataPrefix not allowed".to_string(),
            ));
        }
        if self.catalog.register_prefix(prefix, schema, namespace) {
            self.storage.save_catalog(&self.catalog)?;
            self.catalog_dirty = false;
        }
        self.lists.entry(ListKey::Prefix(prefix.to_string())).or_default();
        Ok(())
    }

    /// Idempotent upsert of a set with its display name.
    pub fn register_set(&mut self, set_spec: &str, set_name: &str) -> Result<(), OaiError> {
        validate_set_spec(set_spec)?;
        if self.catalog.register_set(set_spec, set_name) {
            self.storage.save_catalog(&self.catalog)?;
            self.catalog_dirty = false;
        }
        self.lists.entry(ListKey::Set(set_spec.to_string())).or_default();
        Ok(())
    }

    pub fn all_prefixes(&self) -> Vec<String> {
        self.catalog.prefixes.keys().cloned().collect()
    }

    pub fn all_metadata_formats(&self) -> Vec<MetadataFormat> {
        self.catalog.all_metadata_formats()
    }

    pub fn all_sets(&self) -> Vec<String> {
        self.catalog.sets.keys().cloned().collect()
    }

    pub fn set_name(&self, set_spec: &str) -> Option<&str> {
        self.catalog.set_name(set_spec)
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// OAI-PMH `deletedRecord` flavor this store provides.
    pub fn deleted_record_policy(&self) -> &'static str {
        if self.config.persistent_delete {
            "persistent"
        } else {
            "transient"
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create or update a record. Associations are unioned with everything
    /// previously supplied for the identifier, set hierarchy flattened, a
    /// fresh stamp assigned and the tombstone cleared. Returns the stamp.
    pub fn add_oai_record(
        &mut self,
        identifier: &str,
        set_specs: &[&str],
        metadata_prefixes: &[&str],
    ) -> Result<Stamp, OaiError> {
        if identifier.is_empty() {
            return Err(OaiError::InvalidArgument(
                "empty identifier not allowed".to_string(),
            ));
        }
        if metadata_prefixes.is_empty() {
            return Err(OaiError::InvalidArgument(format!(
                "no metadataPrefix specified for record with identifier {:?}",
                identifier
            )));
        }
        if metadata_prefixes.iter().any(|p| p.is_empty()) {
            return Err(OaiError::InvalidArgument(
                "empty metadataPrefix not allowed".to_string(),
            ));
        }
        for spec in set_specs {
            validate_set_spec(spec)?;
        }

        let old = self.records.get(identifier).cloned();
        let mut next = RecordState {
            prefixes: old.as_ref().map(RecordState::member_prefixes).unwrap_or_default(),
            sets: old.as_ref().map(RecordState::member_sets).unwrap_or_default(),
            deleted_prefixes: old
                .as_ref()
                .map(|o| o.deleted_prefixes.clone())
                .unwrap_or_default(),
            deleted_sets: old.as_ref().map(|o| o.deleted_sets.clone()).unwrap_or_default(),
            tombstone: false,
            stamp: 0,
        };
        next.prefixes.extend(metadata_prefixes.iter().map(|p| p.to_string()));
        next.sets.extend(flatten_set_hierarchy(set_specs.iter().copied()));

        let stamp = self.commit_record_state(identifier, old.as_ref(), next)?;
        debug!("added record {} at stamp {}", identifier, stamp);
        Ok(stamp)
    }

    /// Tombstone a record, moving every live association to deleted. An
    /// unknown identifier is a no-op unless an always-delete policy is
    /// configured, in which case a tombstoned record is created under the
    /// configured prefixes.
    pub fn delete_oai_record(&mut self, identifier: &str) -> Result<(), OaiError> {
        if identifier.is_empty() {
            return Err(OaiError::InvalidArgument(
                "empty identifier not allowed".to_string(),
            ));
        }
        let old = self.records.get(identifier).cloned();
        let next = match old.as_ref() {
            Some(state) => {
                let mut next = state.clone();
                next.deleted_prefixes.extend(state.prefixes.iter().cloned());
                next.deleted_prefixes
                    .extend(self.config.always_delete_in_prefixes.iter().cloned());
                next.prefixes.clear();
                next.deleted_sets.extend(state.sets.iter().cloned());
                next.sets.clear();
                next.tombstone = true;
                next
            }
            None => {
                if self.config.always_delete_in_prefixes.is_empty() {
                    return Ok(());
                }
                RecordState {
                    deleted_prefixes: self
                        .config
                        .always_delete_in_prefixes
                        .iter()
                        .cloned()
                        .collect(),
                    tombstone: true,
                    ..RecordState::default()
                }
            }
        };
        let stamp = self.commit_record_state(identifier, old.as_ref(), next)?;
        debug!("deleted record {} at stamp {}", identifier, stamp);
        Ok(())
    }

    /// Delete a record's association with the given prefixes only. An
    /// unknown identifier gets a record that is deleted under exactly
    /// those prefixes.
    pub fn delete_oai_record_in_prefixes(
        &mut self,
        identifier: &str,
        prefixes: &[&str],
    ) -> Result<(), OaiError> {
        if identifier.is_empty() {
            return Err(OaiError::InvalidArgument(
                "empty identifier not allowed".to_string(),
            ));
        }
        if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
            return Err(OaiError::InvalidArgument(
                "no metadataPrefix to delete in".to_string(),
            ));
        }
        let old = self.records.get(identifier).cloned();
        let mut next = old.clone().unwrap_or_default();
        for prefix in prefixes {
            next.deleted_prefixes.insert(prefix.to_string());
            next.prefixes.remove(*prefix);
        }
        self.commit_record_state(identifier, old.as_ref(), next)?;
        Ok(())
    }

    /// Delete a record's association with the given sets only (no
    /// hierarchy flattening). Unknown identifiers are a no-op.
    pub fn delete_oai_record_in_sets(
        &mut self,
        identifier: &str,
        set_specs: &[&str],
    ) -> Result<(), OaiError> {
        if identifier.is_empty() {
            return Err(OaiError::InvalidArgument(
                "empty identifier not allowed".to_string(),
            ));
        }
        if set_specs.is_empty() {
            return Err(OaiError::InvalidArgument("no setSpec to delete in".to_string()));
        }
        for spec in set_specs {
            validate_set_spec(spec)?;
        }
        let Some(old) = self.records.get(identifier).cloned() else {
            return Ok(());
        };
        let mut next = old.clone();
        for spec in set_specs {
            next.deleted_sets.insert(spec.to_string());
            next.sets.remove(*spec);
        }
        self.commit_record_state(identifier, Some(&old), next)?;
        Ok(())
    }

    /// Maintenance-only hard removal from every list and map. Refused
    /// while deletes are persistent.
    pub fn purge(&mut self, identifier: &str) -> Result<(), OaiError> {
        if self.config.persistent_delete {
            return Err(OaiError::InvalidArgument(
                "purging of records is not allowed with persistent deletes".to_string(),
            ));
        }
        let Some(state) = self.records.remove(identifier) else {
            return Ok(());
        };
        self.stamp_index.remove(&state.stamp);
        let mut removed: Vec<ListKey> = Vec::new();
        for key in member_keys(Some(&state)) {
            if let Some(list) = self.lists.get_mut(&key) {
                if list.remove_if_present(state.stamp) {
                    removed.push(key);
                }
            }
        }
        self.storage
            .append_record(&RecordLogOp::Purge(identifier.to_string()))?;
        self.record_log_entries += 1;
        for key in &removed {
            self.storage
                .append_list_ops(key, &[ListOp::Remove(state.stamp)])?;
        }
        info!("purged record {}", identifier);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_record(&self, identifier: &str) -> Option<OaiRecord> {
        self.records
            .get(identifier)
            .map(|state| record_view(identifier, state))
    }

    /// Datestamp of a record, honoring the configured precision.
    pub fn datestamp(&self, identifier: &str) -> Option<String> {
        self.records
            .get(identifier)
            .map(|state| stamp_to_zulu(state.stamp, self.config.precise_datestamp))
    }

    /// Selective, paginated, time-ranged query: records for `prefix` AND
    /// (any of `sets`), strictly after `continue_after`, within the
    /// from/until range, filtered lazily by partition.
    pub fn oai_select(&self, query: &SelectQuery) -> Result<SelectResult, OaiError> {
        if !self.catalog.has_prefix(&query.prefix) {
            return Err(OaiError::UnknownPrefix(query.prefix.clone()));
        }
        let empty: &[Stamp] = &[];
        let prefix_slice = self
            .lists
            .get(&ListKey::Prefix(query.prefix.clone()))
            .map(PostingList::as_slice)
            .unwrap_or(empty);

        let base_owned: Vec<Stamp>;
        let base: &[Stamp] = if query.sets.is_empty() {
            prefix_slice
        } else {
            let set_slices: Vec<&[Stamp]> = query
                .sets
                .iter()
                .map(|set_spec| {
                    self.lists
                        .get(&ListKey::Set(set_spec.clone()))
                        .map(PostingList::as_slice)
                        .unwrap_or(empty)
                })
                .collect();
            base_owned = intersect_sorted(&union_sorted(&set_slices), prefix_slice);
            &base_owned
        };

        let start = query
            .continue_after
            .saturating_add(1)
            .max(from_time(query.from.as_deref()));
        let stop = until_time(query.until.as_deref());
        let lo = base.partition_point(|&s| s < start);
        let hi = base.partition_point(|&s| s < stop);
        let window = &base[lo..hi];

        let batch_size = if query.batch_size == 0 {
            self.config.default_batch_size
        } else {
            query.batch_size
        };

        let mut records = Vec::new();
        let mut continue_after = query.continue_after;
        let mut more_records_available = false;
        let mut remaining: u64 = 0;
        for &stamp in window {
            let Some(identifier) = self.stamp_index.get(&stamp) else {
                debug_assert!(false, "stamp {} missing from identifier map", stamp);
                continue;
            };
            if let Some(partition) = &query.partition {
                if !partition.matches(identifier) {
                    continue;
                }
            }
            if records.len() < batch_size {
                let Some(state) = self.records.get(identifier) else {
                    debug_assert!(false, "identifier {} missing from record map", identifier);
                    continue;
                };
                records.push(record_view(identifier, state));
                continue_after = stamp;
            } else {
                more_records_available = true;
                if !query.should_count_hits {
                    break;
                }
                remaining += 1;
            }
        }

        if records.is_empty() {
            return Err(OaiError::NoRecordsMatch);
        }
        Ok(SelectResult {
            records,
            more_records_available,
            continue_after,
            records_remaining: query.should_count_hits.then_some(remaining),
        })
    }

    /// Totals for one prefix; zeroes when the prefix is unknown.
    pub fn record_counts(&self, prefix: &str) -> RecordCounts {
        let Some(list) = self.lists.get(&ListKey::Prefix(prefix.to_string())) else {
            return RecordCounts::default();
        };
        let mut counts = RecordCounts {
            total: list.len() as u64,
            deletes: 0,
        };
        for stamp in list.iter() {
            let deleted = self
                .stamp_index
                .get(&stamp)
                .and_then(|identifier| self.records.get(identifier))
                .map(|state| {
                    state.tombstone
                        || (state.deleted_prefixes.contains(prefix)
                            && !state.prefixes.contains(prefix))
                })
                .unwrap_or(false);
            if deleted {
                counts.deletes += 1;
            }
        }
        counts
    }

    /// Newest stamp indexed under a prefix.
    pub fn last_stamp_id(&self, prefix: &str) -> Option<Stamp> {
        self.lists
            .get(&ListKey::Prefix(prefix.to_string()))
            .and_then(PostingList::last)
    }

    /// Newest stamp issued by this store.
    pub fn newest_stamp(&self) -> Stamp {
        self.allocator.newest()
    }

    pub fn total_records(&self) -> usize {
        self.records.len()
    }

    // ------------------------------------------------------------------
    // Batch mode and durability
    // ------------------------------------------------------------------

    /// Defer long-poll wake-ups until the matching `stop_oai_batch`.
    pub fn start_oai_batch(&self) {
        self.register.start_batch(self.allocator.newest());
    }

    pub fn stop_oai_batch(&self) {
        self.register.stop_batch();
    }

    /// Persist the catalog and fsync the logs.
    pub fn commit(&mut self) -> Result<(), OaiError> {
        if self.catalog_dirty {
            self.storage.save_catalog(&self.catalog)?;
            self.catalog_dirty = false;
        }
        self.storage.sync()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Shared tail of every record mutation: allocate the stamp, swap the
    /// record's index entries over as one unit (rolled back on ordering
    /// violation), update the maps, persist and signal.
    fn commit_record_state(
        &mut self,
        identifier: &str,
        old: Option<&RecordState>,
        mut next: RecordState,
    ) -> Result<Stamp, OaiError> {
        let mut catalog_changed = false;
        for prefix in next.member_prefixes() {
            catalog_changed |= self.catalog.ensure_prefix(&prefix);
        }
        for set_spec in next.member_sets() {
            catalog_changed |= self.catalog.ensure_set(&set_spec);
        }
        if catalog_changed {
            self.catalog_dirty = true;
        }

        let old_stamp = old.map(|state| state.stamp);
        let old_keys = member_keys(old);
        let stamp = self.allocator.next();
        next.stamp = stamp;
        let new_keys = member_keys(Some(&next));

        let applied = self.apply_reindex(&old_keys, old_stamp, &new_keys, stamp)?;

        if let Some(old_stamp) = old_stamp {
            self.stamp_index.remove(&old_stamp);
        }
        self.stamp_index.insert(stamp, identifier.to_string());
        let prefixes_touched = next.member_prefixes();
        let sets_touched = next.member_sets();
        let entry = next.to_entry(identifier);
        self.records.insert(identifier.to_string(), next);

        self.persist_mutation(RecordLogOp::Upsert(entry), &applied)?;
        self.register
            .signal_oai_update(&prefixes_touched, &sets_touched, stamp);
        Ok(stamp)
    }

    /// Move a record's index entries from `old_stamp` to `new_stamp`.
    /// On an ordering violation every partial change is undone before the
    /// error propagates.
    fn apply_reindex(
        &mut self,
        old_keys: &[ListKey],
        old_stamp: Option<Stamp>,
        new_keys: &[ListKey],
        new_stamp: Stamp,
    ) -> Result<AppliedOps, OaiError> {
        let mut applied = AppliedOps::default();
        if let Some(old_stamp) = old_stamp {
            for key in old_keys {
                let list = self.lists.entry(key.clone()).or_default();
                if list.remove_if_present(old_stamp) {
                    applied.removed.push((key.clone(), old_stamp));
                }
            }
        }
        for key in new_keys {
            let list = self.lists.entry(key.clone()).or_default();
            if let Err(error) = list.insert(new_stamp) {
                self.rollback(&applied);
                return Err(error);
            }
            applied.inserted.push((key.clone(), new_stamp));
        }
        Ok(applied)
    }

    fn rollback(&mut self, applied: &AppliedOps) {
        for (key, stamp) in &applied.inserted {
            if let Some(list) = self.lists.get_mut(key) {
                list.remove_if_present(*stamp);
            }
        }
        for (key, stamp) in &applied.removed {
            if let Some(list) = self.lists.get_mut(key) {
                list.restore(*stamp);
            }
        }
    }

    fn persist_mutation(
        &mut self,
        entry: RecordLogOp,
        applied: &AppliedOps,
    ) -> Result<(), OaiError> {
        self.storage.append_record(&entry)?;
        self.record_log_entries += 1;
        let mut per_key: BTreeMap<&ListKey, Vec<ListOp>> = BTreeMap::new();
        for (key, stamp) in &applied.removed {
            per_key.entry(key).or_default().push(ListOp::Remove(*stamp));
        }
        for (key, stamp) in &applied.inserted {
            per_key.entry(key).or_default().push(ListOp::Insert(*stamp));
        }
        for (key, ops) in per_key {
            self.storage.append_list_ops(key, &ops)?;
        }
        if self.catalog_dirty {
            self.storage.save_catalog(&self.catalog)?;
            self.catalog_dirty = false;
        }
        Ok(())
    }

    /// Rebuild path used by the dump importer: apply a record with its
    /// literal stamp instead of allocating one.
    pub(crate) fn apply_imported(
        &mut self,
        identifier: &str,
        state: RecordState,
    ) -> Result<(), OaiError> {
        if self.records.contains_key(identifier) {
            return Err(OaiError::InvalidArgument(format!(
                "duplicate identifier {:?} in dump",
                identifier
            )));
        }
        let stamp = state.stamp;
        if stamp <= self.allocator.newest() {
            return Err(OaiError::StampOrdering {
                stamp,
                newest: self.allocator.newest(),
            });
        }
        let new_keys = member_keys(Some(&state));
        let applied = self.apply_reindex(&[], None, &new_keys, stamp)?;
        self.allocator.observe(stamp);
        self.stamp_index.insert(stamp, identifier.to_string());
        let entry = state.to_entry(identifier);
        self.records.insert(identifier.to_string(), state);
        self.persist_mutation(RecordLogOp::Upsert(entry), &applied)
    }

    pub(crate) fn records_in_stamp_order(&self) -> impl Iterator<Item = (&str, &RecordState)> {
        self.stamp_index.values().filter_map(|identifier| {
            self.records
                .get(identifier)
                .map(|state| (identifier.as_str(), state))
        })
    }
}

#[derive(Debug, Default)]
struct AppliedOps {
    removed: Vec<(ListKey, Stamp)>,
    inserted: Vec<(ListKey, Stamp)>,
}

fn member_keys(state: Option<&RecordState>) -> Vec<ListKey> {
    let Some(state) = state else {
        return Vec::new();
    };
    let mut keys: Vec<ListKey> = state
        .member_prefixes()
        .into_iter()
        .map(ListKey::Prefix)
        .collect();
    keys.extend(state.member_sets().into_iter().map(ListKey::Set));
    if state.tombstone {
        keys.push(ListKey::Tombstones);
    }
    keys
}

fn record_view(identifier: &str, state: &RecordState) -> OaiRecord {
    OaiRecord {
        identifier: identifier.to_string(),
        stamp: state.stamp,
        tombstone: state.tombstone,
        prefixes: state.prefixes.iter().cloned().collect(),
        deleted_prefixes: state.deleted_prefixes.iter().cloned().collect(),
        sets: state.sets.iter().cloned().collect(),
        deleted_sets: state.deleted_sets.iter().cloned().collect(),
    }
}

fn replay_list_ops(ops: &[ListOp]) -> Vec<Stamp> {
    let mut stamps: Vec<Stamp> = Vec::new();
    for op in ops {
        match op {
            ListOp::Insert(stamp) => {
                if let Err(position) = stamps.binary_search(stamp) {
                    stamps.insert(position, *stamp);
                }
            }
            ListOp::Remove(stamp) => {
                if let Ok(position) = stamps.binary_search(stamp) {
                    stamps.remove(position);
                }
            }
        }
    }
    stamps
}
