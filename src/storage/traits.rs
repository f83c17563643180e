//! Storage trait definitions
//!
//! The engine consumes a document store supporting quick-id indexed lookup,
//! per-document upsert with duplicate-key discrimination, bulk insert with
//! partial-failure tolerance, guarded in-place member updates, atomic
//! counters, and all-or-nothing sessions for the multi-document merge/split
//! paths.

use crate::entity::{
    AdapterEntity, AdapterIdentity, EntityType, InternalAxonId, MergedEntity, QuickId,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the whole operation may succeed (lock contention,
    /// busy database). Exhausted retries propagate the error unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a guarded in-place member update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberUpdate {
    /// No merged entity holds this quick id.
    NoMatch,
    /// A member exists but already carries newer data; the incoming record
    /// must be dropped, not written.
    Stale,
    /// The member was overwritten in place.
    Updated,
}

/// Outcome of an unordered bulk insert: duplicates do not abort the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkInsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Document operations shared by the store and its transactional sessions.
pub trait EntityOps {
    // === Merged-entity lookup ===

    /// Find every merged entity owning any of the given quick ids
    /// (membership OR query).
    fn find_by_quick_ids(
        &self,
        entity_type: EntityType,
        quick_ids: &[QuickId],
    ) -> StorageResult<Vec<MergedEntity>>;

    fn find_by_internal_axon_ids(
        &self,
        entity_type: EntityType,
        ids: &[InternalAxonId],
    ) -> StorageResult<Vec<MergedEntity>>;

    /// Fast probe: does this plugin have any member in the collection?
    fn plugin_has_members(
        &self,
        entity_type: EntityType,
        plugin_unique_name: &str,
    ) -> StorageResult<bool>;

    // === Merged-entity mutation ===

    /// Insert a new merged entity. Fails with
    /// [`StorageError::DuplicateKey`] when the internal axon id or any
    /// member quick id already exists.
    fn insert_entity(&self, entity_type: EntityType, entity: &MergedEntity) -> StorageResult<()>;

    /// Bulk insert, unordered: per-document duplicate keys are counted and
    /// skipped rather than aborting the batch.
    fn insert_entities(
        &self,
        entity_type: EntityType,
        entities: &[MergedEntity],
    ) -> StorageResult<BulkInsertOutcome>;

    /// Overwrite an existing merged entity document (matched by its
    /// internal axon id) and rebuild its member index rows.
    fn replace_entity(&self, entity_type: EntityType, entity: &MergedEntity) -> StorageResult<()>;

    /// Overwrite a document whose stored internal axon id is changing
    /// (canonical-ID handoff during a split).
    fn replace_entity_reidentified(
        &self,
        entity_type: EntityType,
        previous_id: &InternalAxonId,
        entity: &MergedEntity,
    ) -> StorageResult<()>;

    fn delete_entities(
        &self,
        entity_type: EntityType,
        ids: &[InternalAxonId],
    ) -> StorageResult<usize>;

    /// Atomically remove and return the merged entity owning the quick id.
    fn find_and_delete_by_quick_id(
        &self,
        entity_type: EntityType,
        quick_id: &QuickId,
    ) -> StorageResult<Option<MergedEntity>>;

    // === Member-scoped mutation ===

    /// Overwrite the member matching `incoming.quick_id` in place inside
    /// its owning merged entity. With `guard_last_seen`, an existing member
    /// carrying strictly newer data rejects the write (stale-write
    /// rejection); callers log and drop, they do not error.
    fn update_member_guarded(
        &self,
        entity_type: EntityType,
        incoming: &AdapterEntity,
        guard_last_seen: bool,
    ) -> StorageResult<MemberUpdate>;

    /// Append a first-seen member into the merged entity owning
    /// `target_quick_id` (the scanner correlate case). Returns false when no
    /// such entity exists.
    fn append_member(
        &self,
        entity_type: EntityType,
        target_quick_id: &QuickId,
        member: &AdapterEntity,
    ) -> StorageResult<bool>;

    // === Side stores ===

    /// Upsert the raw payload for an adapter identity.
    fn upsert_raw(
        &self,
        entity_type: EntityType,
        identity: &AdapterIdentity,
        raw: &Value,
    ) -> StorageResult<()>;

    fn delete_raw(
        &self,
        entity_type: EntityType,
        identity: &AdapterIdentity,
    ) -> StorageResult<bool>;

    /// Write a decommissioned entity to the archive store.
    fn archive_entity(&self, entity_type: EntityType, entity: &MergedEntity) -> StorageResult<()>;

    /// Park a record the ingestion pipeline was told to ignore.
    fn save_ignored_record(
        &self,
        entity_type: EntityType,
        record: &AdapterEntity,
    ) -> StorageResult<()>;

    // === Counters and catalogues ===

    /// Atomically increment the named counter by `by` and return the
    /// post-increment value.
    fn increment_counter(&self, name: &str, by: u64) -> StorageResult<u64>;

    /// Merge field names into the per-plugin field catalogue.
    fn save_field_names(
        &self,
        entity_type: EntityType,
        plugin_unique_name: &str,
        fields: &BTreeSet<String>,
    ) -> StorageResult<()>;

    fn load_field_names(
        &self,
        entity_type: EntityType,
        plugin_unique_name: &str,
    ) -> StorageResult<BTreeSet<String>>;

    // === Scans ===

    /// Merged entities holding a member of this plugin that lacks a
    /// `pretty_id`.
    fn entities_missing_pretty_id(
        &self,
        entity_type: EntityType,
        plugin_unique_name: &str,
    ) -> StorageResult<Vec<MergedEntity>>;

    fn count_entities(&self, entity_type: EntityType) -> StorageResult<usize>;
}

/// Convenience single-key lookup.
pub fn find_by_quick_id<S: EntityOps + ?Sized>(
    store: &S,
    entity_type: EntityType,
    quick_id: &QuickId,
) -> StorageResult<Option<MergedEntity>> {
    Ok(store
        .find_by_quick_ids(entity_type, std::slice::from_ref(quick_id))?
        .into_iter()
        .next())
}

/// A transaction scope. All operations are all-or-nothing: either
/// [`commit`](StoreSession::commit) is called and everything lands, or the
/// session rolls back on drop.
pub trait StoreSession: EntityOps {
    fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// Trait for entity storage backends
///
/// Implementations must be thread-safe (Send + Sync) to support concurrent
/// access from the ingestion worker pool.
pub trait EntityStore: EntityOps + Send + Sync {
    /// Open a transaction session. The session serializes against all other
    /// writers for its lifetime.
    fn session(&self) -> StorageResult<Box<dyn StoreSession + '_>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: EntityStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
