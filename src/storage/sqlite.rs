//! SQLite storage backend for the entity correlation engine
//!
//! Merged entities persist as JSON documents with a member index table
//! (`entity_members`) mapping each quick id to its owning document. The
//! index table's primary key on `(entity_type, quick_id)` enforces the
//! at-most-one-merged-entity invariant at the schema level: any write that
//! would give an adapter entity two owners fails with a duplicate key.
//!
//! Thread-safe via internal mutex on the connection. Sessions hold the
//! mutex for their lifetime, so a transaction serializes all other writers
//! until it commits or rolls back.

use super::traits::{
    BulkInsertOutcome, EntityOps, EntityStore, MemberUpdate, OpenStore, StorageError,
    StorageResult, StoreSession,
};
use crate::entity::{
    recalculate_oldness, AdapterEntity, AdapterIdentity, EntityType, InternalAxonId, MergedEntity,
    QuickId,
};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// SQLite-backed entity store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Merged entity documents, one row per entity
            CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                internal_axon_id TEXT NOT NULL,
                doc_json TEXT NOT NULL,
                PRIMARY KEY (entity_type, internal_axon_id)
            );

            -- Member index: one row per adapter entity. The primary key on
            -- quick_id makes dual ownership a constraint violation.
            CREATE TABLE IF NOT EXISTS entity_members (
                entity_type TEXT NOT NULL,
                quick_id TEXT NOT NULL,
                internal_axon_id TEXT NOT NULL,
                plugin_unique_name TEXT NOT NULL,
                plugin_name TEXT NOT NULL,
                PRIMARY KEY (entity_type, quick_id)
            );
            CREATE INDEX IF NOT EXISTS idx_members_axon
                ON entity_members(entity_type, internal_axon_id);
            CREATE INDEX IF NOT EXISTS idx_members_plugin
                ON entity_members(entity_type, plugin_unique_name);

            -- Raw payload side store keyed by adapter identity
            CREATE TABLE IF NOT EXISTS raw_entities (
                entity_type TEXT NOT NULL,
                plugin_unique_name TEXT NOT NULL,
                native_id TEXT NOT NULL,
                raw_json TEXT NOT NULL,
                PRIMARY KEY (entity_type, plugin_unique_name, native_id)
            );

            -- Archive of decommissioned entities (write-then-delete)
            CREATE TABLE IF NOT EXISTS entity_archive (
                entity_type TEXT NOT NULL,
                internal_axon_id TEXT NOT NULL,
                doc_json TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            -- Records the pipeline was told to ignore
            CREATE TABLE IF NOT EXISTS ignored_records (
                entity_type TEXT NOT NULL,
                plugin_unique_name TEXT NOT NULL,
                native_id TEXT NOT NULL,
                doc_json TEXT NOT NULL,
                ignored_at TEXT NOT NULL
            );

            -- Atomic counters (pretty-ID issuance)
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- Per-plugin field-name catalogue for downstream discovery
            CREATE TABLE IF NOT EXISTS adapter_fields (
                entity_type TEXT NOT NULL,
                plugin_unique_name TEXT NOT NULL,
                field_name TEXT NOT NULL,
                PRIMARY KEY (entity_type, plugin_unique_name, field_name)
            );

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn locked(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl EntityStore for SqliteStore {
    fn session(&self) -> StorageResult<Box<dyn StoreSession + '_>> {
        let guard = self.conn.lock().unwrap();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteSession { guard, open: true }))
    }
}

/// A transaction holding the connection mutex until commit or rollback.
struct SqliteSession<'a> {
    guard: MutexGuard<'a, Connection>,
    open: bool,
}

impl SqliteSession<'_> {
    fn borrowed(&self) -> &Connection {
        &self.guard
    }
}

impl StoreSession for SqliteSession<'_> {
    fn commit(mut self: Box<Self>) -> StorageResult<()> {
        self.guard.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.guard.execute_batch("ROLLBACK") {
                warn!("failed to roll back abandoned session: {e}");
            }
        }
    }
}

/// Run `f` inside a savepoint so multi-statement writes are atomic both
/// standalone and nested inside a session transaction.
fn with_savepoint<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> StorageResult<T>,
) -> StorageResult<T> {
    conn.execute_batch("SAVEPOINT entity_op")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE entity_op")?;
            Ok(value)
        }
        Err(e) => {
            // Preserve the original error even if the rollback itself fails.
            if let Err(rollback_err) =
                conn.execute_batch("ROLLBACK TO entity_op; RELEASE entity_op")
            {
                warn!("savepoint rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn map_duplicate(e: rusqlite::Error, key: impl std::fmt::Display) -> StorageError {
    if is_constraint_violation(&e) {
        StorageError::DuplicateKey(key.to_string())
    } else {
        StorageError::Database(e)
    }
}

/// Placeholders "?2,?3,..." for an IN clause following a ?1 parameter.
fn sql_placeholders(count: usize) -> String {
    let mut s = String::new();
    for i in 0..count {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
        s.push_str(&(i + 2).to_string());
    }
    s
}

fn doc_from_row(doc_json: String) -> StorageResult<MergedEntity> {
    Ok(serde_json::from_str(&doc_json)?)
}

fn load_by_internal_axon_id(
    conn: &Connection,
    entity_type: EntityType,
    id: &InternalAxonId,
) -> StorageResult<Option<MergedEntity>> {
    let doc_json: Option<String> = conn
        .query_row(
            "SELECT doc_json FROM entities WHERE entity_type = ?1 AND internal_axon_id = ?2",
            params![entity_type.as_str(), id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    doc_json.map(doc_from_row).transpose()
}

fn owner_of_quick_id(
    conn: &Connection,
    entity_type: EntityType,
    quick_id: &QuickId,
) -> StorageResult<Option<InternalAxonId>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT internal_axon_id FROM entity_members WHERE entity_type = ?1 AND quick_id = ?2",
            params![entity_type.as_str(), quick_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(InternalAxonId::from_string))
}

fn insert_member_rows(
    conn: &Connection,
    entity_type: EntityType,
    entity: &MergedEntity,
) -> StorageResult<()> {
    for member in &entity.adapters {
        conn.execute(
            "INSERT INTO entity_members \
             (entity_type, quick_id, internal_axon_id, plugin_unique_name, plugin_name) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entity_type.as_str(),
                member.quick_id.as_str(),
                entity.internal_axon_id.as_str(),
                member.plugin_unique_name,
                member.plugin_name,
            ],
        )
        .map_err(|e| map_duplicate(e, &member.quick_id))?;
    }
    Ok(())
}

fn insert_entity_doc(
    conn: &Connection,
    entity_type: EntityType,
    entity: &MergedEntity,
) -> StorageResult<()> {
    with_savepoint(conn, |conn| {
        let doc_json = serde_json::to_string(entity)?;
        conn.execute(
            "INSERT INTO entities (entity_type, internal_axon_id, doc_json) VALUES (?1, ?2, ?3)",
            params![
                entity_type.as_str(),
                entity.internal_axon_id.as_str(),
                doc_json
            ],
        )
        .map_err(|e| map_duplicate(e, &entity.internal_axon_id))?;
        insert_member_rows(conn, entity_type, entity)
    })
}

fn replace_entity_doc(
    conn: &Connection,
    entity_type: EntityType,
    previous_id: &InternalAxonId,
    entity: &MergedEntity,
) -> StorageResult<()> {
    with_savepoint(conn, |conn| {
        let doc_json = serde_json::to_string(entity)?;
        let changed = conn.execute(
            "UPDATE entities SET internal_axon_id = ?3, doc_json = ?4 \
             WHERE entity_type = ?1 AND internal_axon_id = ?2",
            params![
                entity_type.as_str(),
                previous_id.as_str(),
                entity.internal_axon_id.as_str(),
                doc_json
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::EntityNotFound(previous_id.to_string()));
        }
        conn.execute(
            "DELETE FROM entity_members WHERE entity_type = ?1 AND internal_axon_id = ?2",
            params![entity_type.as_str(), previous_id.as_str()],
        )?;
        insert_member_rows(conn, entity_type, entity)
    })
}

fn delete_entity_docs(
    conn: &Connection,
    entity_type: EntityType,
    ids: &[InternalAxonId],
) -> StorageResult<usize> {
    with_savepoint(conn, |conn| {
        let mut deleted = 0;
        for id in ids {
            conn.execute(
                "DELETE FROM entity_members WHERE entity_type = ?1 AND internal_axon_id = ?2",
                params![entity_type.as_str(), id.as_str()],
            )?;
            deleted += conn.execute(
                "DELETE FROM entities WHERE entity_type = ?1 AND internal_axon_id = ?2",
                params![entity_type.as_str(), id.as_str()],
            )?;
        }
        Ok(deleted)
    })
}

fn op_find_by_quick_ids(
    conn: &Connection,
    entity_type: EntityType,
    quick_ids: &[QuickId],
) -> StorageResult<Vec<MergedEntity>> {
    if quick_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT e.doc_json FROM entities e \
         JOIN entity_members m ON m.entity_type = e.entity_type \
             AND m.internal_axon_id = e.internal_axon_id \
         WHERE e.entity_type = ?1 AND m.quick_id IN ({})",
        sql_placeholders(quick_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_iter = std::iter::once(entity_type.as_str().to_string())
        .chain(quick_ids.iter().map(|q| q.as_str().to_string()));
    let rows = stmt.query_map(params_from_iter(params_iter), |row| {
        row.get::<_, String>(0)
    })?;
    let mut entities = Vec::new();
    for row in rows {
        entities.push(doc_from_row(row?)?);
    }
    Ok(entities)
}

fn op_find_by_internal_axon_ids(
    conn: &Connection,
    entity_type: EntityType,
    ids: &[InternalAxonId],
) -> StorageResult<Vec<MergedEntity>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT doc_json FROM entities \
         WHERE entity_type = ?1 AND internal_axon_id IN ({})",
        sql_placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_iter = std::iter::once(entity_type.as_str().to_string())
        .chain(ids.iter().map(|i| i.as_str().to_string()));
    let rows = stmt.query_map(params_from_iter(params_iter), |row| {
        row.get::<_, String>(0)
    })?;
    let mut entities = Vec::new();
    for row in rows {
        entities.push(doc_from_row(row?)?);
    }
    Ok(entities)
}

fn op_update_member_guarded(
    conn: &Connection,
    entity_type: EntityType,
    incoming: &AdapterEntity,
    guard_last_seen: bool,
) -> StorageResult<MemberUpdate> {
    let Some(owner) = owner_of_quick_id(conn, entity_type, &incoming.quick_id)? else {
        return Ok(MemberUpdate::NoMatch);
    };
    let Some(mut doc) = load_by_internal_axon_id(conn, entity_type, &owner)? else {
        warn!(
            quick_id = %incoming.quick_id,
            "member index points at missing document {owner}"
        );
        return Ok(MemberUpdate::NoMatch);
    };
    let Some(idx) = doc
        .adapters
        .iter()
        .position(|a| a.quick_id == incoming.quick_id)
    else {
        return Ok(MemberUpdate::NoMatch);
    };

    if guard_last_seen {
        // An existing member with strictly newer last_seen wins; a member
        // that has last_seen while the incoming record has none also wins.
        let keep = match (incoming.last_seen(), doc.adapters[idx].last_seen()) {
            (Some(incoming_ls), Some(existing_ls)) => existing_ls <= incoming_ls,
            (None, None) => true,
            _ => false,
        };
        if !keep {
            return Ok(MemberUpdate::Stale);
        }
    }

    let member = &mut doc.adapters[idx];
    member.client_used = incoming.client_used.clone();
    member.plugin_type = incoming.plugin_type.clone();
    member.plugin_name = incoming.plugin_name.clone();
    member.accurate_for_datetime = incoming.accurate_for_datetime;
    // Fields present in the incoming record overwrite; fields only present
    // in the stored member (first_fetch_time, pretty_id, _old) stay.
    for (key, value) in &incoming.data {
        member.data.insert(key.clone(), value.clone());
    }

    recalculate_oldness(&mut doc.adapters, entity_type);
    doc.accurate_for_datetime = Utc::now();
    replace_entity_doc(conn, entity_type, &owner, &doc)?;
    Ok(MemberUpdate::Updated)
}

fn op_append_member(
    conn: &Connection,
    entity_type: EntityType,
    target_quick_id: &QuickId,
    member: &AdapterEntity,
) -> StorageResult<bool> {
    let Some(owner) = owner_of_quick_id(conn, entity_type, target_quick_id)? else {
        return Ok(false);
    };
    let Some(mut doc) = load_by_internal_axon_id(conn, entity_type, &owner)? else {
        return Ok(false);
    };
    doc.adapters.push(member.clone());
    recalculate_oldness(&mut doc.adapters, entity_type);
    doc.refresh_adapter_list_length();
    doc.accurate_for_datetime = Utc::now();
    replace_entity_doc(conn, entity_type, &owner, &doc)?;
    Ok(true)
}

fn op_entities_missing_pretty_id(
    conn: &Connection,
    entity_type: EntityType,
    plugin_unique_name: &str,
) -> StorageResult<Vec<MergedEntity>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e.doc_json FROM entities e \
         JOIN entity_members m ON m.entity_type = e.entity_type \
             AND m.internal_axon_id = e.internal_axon_id \
         WHERE e.entity_type = ?1 AND m.plugin_unique_name = ?2",
    )?;
    let rows = stmt.query_map(params![entity_type.as_str(), plugin_unique_name], |row| {
        row.get::<_, String>(0)
    })?;
    let mut entities = Vec::new();
    for row in rows {
        let doc = doc_from_row(row?)?;
        let lacks_pretty_id = doc.adapters.iter().any(|a| {
            a.plugin_unique_name == plugin_unique_name && !a.data.contains_key("pretty_id")
        });
        if lacks_pretty_id {
            entities.push(doc);
        }
    }
    Ok(entities)
}

// The store takes the mutex per call; the session already holds it. Same
// operation logic either way, so generate both impls over the accessor.
macro_rules! impl_entity_ops {
    ($ty:ty, $conn:ident) => {
        impl EntityOps for $ty {
            fn find_by_quick_ids(
                &self,
                entity_type: EntityType,
                quick_ids: &[QuickId],
            ) -> StorageResult<Vec<MergedEntity>> {
                let conn = self.$conn();
                op_find_by_quick_ids(&conn, entity_type, quick_ids)
            }

            fn find_by_internal_axon_ids(
                &self,
                entity_type: EntityType,
                ids: &[InternalAxonId],
            ) -> StorageResult<Vec<MergedEntity>> {
                let conn = self.$conn();
                op_find_by_internal_axon_ids(&conn, entity_type, ids)
            }

            fn plugin_has_members(
                &self,
                entity_type: EntityType,
                plugin_unique_name: &str,
            ) -> StorageResult<bool> {
                let present: i64 = self.$conn().query_row(
                    "SELECT EXISTS(SELECT 1 FROM entity_members \
                     WHERE entity_type = ?1 AND plugin_unique_name = ?2)",
                    params![entity_type.as_str(), plugin_unique_name],
                    |row| row.get(0),
                )?;
                Ok(present != 0)
            }

            fn insert_entity(
                &self,
                entity_type: EntityType,
                entity: &MergedEntity,
            ) -> StorageResult<()> {
                let conn = self.$conn();
                insert_entity_doc(&conn, entity_type, entity)
            }

            fn insert_entities(
                &self,
                entity_type: EntityType,
                entities: &[MergedEntity],
            ) -> StorageResult<BulkInsertOutcome> {
                let conn = self.$conn();
                let mut outcome = BulkInsertOutcome::default();
                for entity in entities {
                    match insert_entity_doc(&conn, entity_type, entity) {
                        Ok(()) => outcome.inserted += 1,
                        Err(StorageError::DuplicateKey(key)) => {
                            warn!("duplicate key during bulk insert of {entity_type}: {key}");
                            outcome.duplicates += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(outcome)
            }

            fn replace_entity(
                &self,
                entity_type: EntityType,
                entity: &MergedEntity,
            ) -> StorageResult<()> {
                let conn = self.$conn();
                replace_entity_doc(&conn, entity_type, &entity.internal_axon_id, entity)
            }

            fn replace_entity_reidentified(
                &self,
                entity_type: EntityType,
                previous_id: &InternalAxonId,
                entity: &MergedEntity,
            ) -> StorageResult<()> {
                let conn = self.$conn();
                replace_entity_doc(&conn, entity_type, previous_id, entity)
            }

            fn delete_entities(
                &self,
                entity_type: EntityType,
                ids: &[InternalAxonId],
            ) -> StorageResult<usize> {
                let conn = self.$conn();
                delete_entity_docs(&conn, entity_type, ids)
            }

            fn find_and_delete_by_quick_id(
                &self,
                entity_type: EntityType,
                quick_id: &QuickId,
            ) -> StorageResult<Option<MergedEntity>> {
                let conn = self.$conn();
                with_savepoint(&conn, |conn| {
                    let Some(owner) = owner_of_quick_id(conn, entity_type, quick_id)? else {
                        return Ok(None);
                    };
                    let doc = load_by_internal_axon_id(conn, entity_type, &owner)?;
                    delete_entity_docs(conn, entity_type, std::slice::from_ref(&owner))?;
                    Ok(doc)
                })
            }

            fn update_member_guarded(
                &self,
                entity_type: EntityType,
                incoming: &AdapterEntity,
                guard_last_seen: bool,
            ) -> StorageResult<MemberUpdate> {
                let conn = self.$conn();
                op_update_member_guarded(&conn, entity_type, incoming, guard_last_seen)
            }

            fn append_member(
                &self,
                entity_type: EntityType,
                target_quick_id: &QuickId,
                member: &AdapterEntity,
            ) -> StorageResult<bool> {
                let conn = self.$conn();
                op_append_member(&conn, entity_type, target_quick_id, member)
            }

            fn upsert_raw(
                &self,
                entity_type: EntityType,
                identity: &AdapterIdentity,
                raw: &Value,
            ) -> StorageResult<()> {
                self.$conn().execute(
                    "INSERT INTO raw_entities \
                     (entity_type, plugin_unique_name, native_id, raw_json) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(entity_type, plugin_unique_name, native_id) \
                     DO UPDATE SET raw_json = excluded.raw_json",
                    params![
                        entity_type.as_str(),
                        identity.plugin_unique_name,
                        identity.native_id,
                        serde_json::to_string(raw)?
                    ],
                )?;
                Ok(())
            }

            fn delete_raw(
                &self,
                entity_type: EntityType,
                identity: &AdapterIdentity,
            ) -> StorageResult<bool> {
                let deleted = self.$conn().execute(
                    "DELETE FROM raw_entities \
                     WHERE entity_type = ?1 AND plugin_unique_name = ?2 AND native_id = ?3",
                    params![
                        entity_type.as_str(),
                        identity.plugin_unique_name,
                        identity.native_id
                    ],
                )?;
                Ok(deleted > 0)
            }

            fn archive_entity(
                &self,
                entity_type: EntityType,
                entity: &MergedEntity,
            ) -> StorageResult<()> {
                self.$conn().execute(
                    "INSERT INTO entity_archive \
                     (entity_type, internal_axon_id, doc_json, archived_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        entity_type.as_str(),
                        entity.internal_axon_id.as_str(),
                        serde_json::to_string(entity)?,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            }

            fn save_ignored_record(
                &self,
                entity_type: EntityType,
                record: &AdapterEntity,
            ) -> StorageResult<()> {
                self.$conn().execute(
                    "INSERT INTO ignored_records \
                     (entity_type, plugin_unique_name, native_id, doc_json, ignored_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entity_type.as_str(),
                        record.plugin_unique_name,
                        record.native_id(),
                        serde_json::to_string(record)?,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            }

            fn increment_counter(&self, name: &str, by: u64) -> StorageResult<u64> {
                let value: i64 = self.$conn().query_row(
                    "INSERT INTO counters (name, value) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO UPDATE SET value = counters.value + excluded.value \
                     RETURNING value",
                    params![name, by as i64],
                    |row| row.get(0),
                )?;
                Ok(value as u64)
            }

            fn save_field_names(
                &self,
                entity_type: EntityType,
                plugin_unique_name: &str,
                fields: &BTreeSet<String>,
            ) -> StorageResult<()> {
                let conn = self.$conn();
                with_savepoint(&conn, |conn| {
                    for field in fields {
                        conn.execute(
                            "INSERT OR IGNORE INTO adapter_fields \
                             (entity_type, plugin_unique_name, field_name) VALUES (?1, ?2, ?3)",
                            params![entity_type.as_str(), plugin_unique_name, field],
                        )?;
                    }
                    Ok(())
                })
            }

            fn load_field_names(
                &self,
                entity_type: EntityType,
                plugin_unique_name: &str,
            ) -> StorageResult<BTreeSet<String>> {
                let conn = self.$conn();
                let mut stmt = conn.prepare(
                    "SELECT field_name FROM adapter_fields \
                     WHERE entity_type = ?1 AND plugin_unique_name = ?2",
                )?;
                let rows = stmt
                    .query_map(params![entity_type.as_str(), plugin_unique_name], |row| {
                        row.get::<_, String>(0)
                    })?;
                let mut fields = BTreeSet::new();
                for row in rows {
                    fields.insert(row?);
                }
                Ok(fields)
            }

            fn entities_missing_pretty_id(
                &self,
                entity_type: EntityType,
                plugin_unique_name: &str,
            ) -> StorageResult<Vec<MergedEntity>> {
                let conn = self.$conn();
                op_entities_missing_pretty_id(&conn, entity_type, plugin_unique_name)
            }

            fn count_entities(&self, entity_type: EntityType) -> StorageResult<usize> {
                let count: i64 = self.$conn().query_row(
                    "SELECT COUNT(*) FROM entities WHERE entity_type = ?1",
                    params![entity_type.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            }
        }
    };
}

impl_entity_ops!(SqliteStore, locked);
impl_entity_ops!(SqliteSession<'_>, borrowed);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PluginIdentity;
    use crate::storage::traits::find_by_quick_id;
    use serde_json::json;

    fn plugin(n: u32) -> PluginIdentity {
        PluginIdentity::new("Adapter", format!("ad{n}"), format!("ad{n}_adapter_0"))
    }

    fn member(plugin: &PluginIdentity, native_id: &str) -> AdapterEntity {
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(native_id));
        AdapterEntity::new(Some("client".into()), plugin, data)
    }

    fn single(plugin: &PluginIdentity, native_id: &str) -> MergedEntity {
        MergedEntity::for_single(member(plugin, native_id))
    }

    #[test]
    fn test_insert_and_find_by_quick_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entity = single(&plugin(1), "dev1");
        let quick_id = entity.adapters[0].quick_id.clone();
        store.insert_entity(EntityType::Devices, &entity).unwrap();

        let found = find_by_quick_id(&store, EntityType::Devices, &quick_id)
            .unwrap()
            .unwrap();
        assert_eq!(found.internal_axon_id, entity.internal_axon_id);
        assert_eq!(found.adapters.len(), 1);
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entity = single(&plugin(1), "dev1");
        store.insert_entity(EntityType::Devices, &entity).unwrap();
        let err = store
            .insert_entity(EntityType::Devices, &entity)
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[test]
    fn test_dual_ownership_rejected() {
        // Two documents claiming the same member quick id must not coexist.
        let store = SqliteStore::open_in_memory().unwrap();
        let entity = single(&plugin(1), "dev1");
        store.insert_entity(EntityType::Devices, &entity).unwrap();

        let mut other = single(&plugin(2), "other");
        other.adapters.push(member(&plugin(1), "dev1"));
        let err = store
            .insert_entity(EntityType::Devices, &other)
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
        // The failed insert must not leave an orphan document behind.
        assert_eq!(store.count_entities(EntityType::Devices).unwrap(), 1);
    }

    #[test]
    fn test_entity_types_isolated() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entity = single(&plugin(1), "dev1");
        let quick_id = entity.adapters[0].quick_id.clone();
        store.insert_entity(EntityType::Devices, &entity).unwrap();
        assert!(find_by_quick_id(&store, EntityType::Users, &quick_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bulk_insert_skips_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = single(&plugin(1), "dev1");
        let b = single(&plugin(1), "dev2");
        store.insert_entity(EntityType::Devices, &a).unwrap();

        let outcome = store.insert_entities(EntityType::Devices, &[a, b]).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(store.count_entities(EntityType::Devices).unwrap(), 2);
    }

    #[test]
    fn test_update_member_guarded_stale_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = plugin(1);
        let mut fresh = member(&p, "dev1");
        fresh
            .data
            .insert("last_seen".into(), json!("2024-06-01T00:00:00Z"));
        store
            .insert_entity(EntityType::Devices, &MergedEntity::for_single(fresh))
            .unwrap();

        let mut stale = member(&p, "dev1");
        stale
            .data
            .insert("last_seen".into(), json!("2024-01-01T00:00:00Z"));
        let outcome = store
            .update_member_guarded(EntityType::Devices, &stale, true)
            .unwrap();
        assert_eq!(outcome, MemberUpdate::Stale);

        // Without the guard the same write goes through.
        let outcome = store
            .update_member_guarded(EntityType::Devices, &stale, false)
            .unwrap();
        assert_eq!(outcome, MemberUpdate::Updated);
    }

    #[test]
    fn test_update_member_preserves_unmentioned_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = plugin(1);
        let mut original = member(&p, "dev1");
        original.data.insert("pretty_id".into(), json!("AX-1"));
        original.data.insert("hostname".into(), json!("h1"));
        let quick_id = original.quick_id.clone();
        store
            .insert_entity(EntityType::Devices, &MergedEntity::for_single(original))
            .unwrap();

        let mut update = member(&p, "dev1");
        update.data.insert("hostname".into(), json!("h2"));
        store
            .update_member_guarded(EntityType::Devices, &update, false)
            .unwrap();

        let found = find_by_quick_id(&store, EntityType::Devices, &quick_id)
            .unwrap()
            .unwrap();
        assert_eq!(found.adapters[0].data["hostname"], json!("h2"));
        assert_eq!(found.adapters[0].data["pretty_id"], json!("AX-1"));
    }

    #[test]
    fn test_append_member() {
        let store = SqliteStore::open_in_memory().unwrap();
        let target = single(&plugin(1), "dev1");
        let target_quick = target.adapters[0].quick_id.clone();
        store.insert_entity(EntityType::Devices, &target).unwrap();

        let scanner = member(&plugin(2), "scan1");
        let appended = store
            .append_member(EntityType::Devices, &target_quick, &scanner)
            .unwrap();
        assert!(appended);

        let found = find_by_quick_id(&store, EntityType::Devices, &target_quick)
            .unwrap()
            .unwrap();
        assert_eq!(found.adapters.len(), 2);
        assert_eq!(found.adapter_list_length, 2);
    }

    #[test]
    fn test_append_member_missing_target() {
        let store = SqliteStore::open_in_memory().unwrap();
        let quick = crate::entity::quick_id("nope", "nothing");
        let appended = store
            .append_member(EntityType::Devices, &quick, &member(&plugin(1), "x"))
            .unwrap();
        assert!(!appended);
    }

    #[test]
    fn test_session_rollback_on_drop() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let session = store.session().unwrap();
            session
                .insert_entity(EntityType::Devices, &single(&plugin(1), "dev1"))
                .unwrap();
            // dropped without commit
        }
        assert_eq!(store.count_entities(EntityType::Devices).unwrap(), 0);
    }

    #[test]
    fn test_session_commit_persists() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = store.session().unwrap();
        session
            .insert_entity(EntityType::Devices, &single(&plugin(1), "dev1"))
            .unwrap();
        session.commit().unwrap();
        assert_eq!(store.count_entities(EntityType::Devices).unwrap(), 1);
    }

    #[test]
    fn test_counter_monotonic() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.increment_counter("pretty_id", 5).unwrap(), 5);
        assert_eq!(store.increment_counter("pretty_id", 3).unwrap(), 8);
        assert_eq!(store.increment_counter("other", 1).unwrap(), 1);
    }

    #[test]
    fn test_raw_side_store_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let identity = AdapterIdentity::new("ad1_adapter_0", "dev1");
        store
            .upsert_raw(EntityType::Devices, &identity, &json!({"raw": 1}))
            .unwrap();
        store
            .upsert_raw(EntityType::Devices, &identity, &json!({"raw": 2}))
            .unwrap();
        assert!(store.delete_raw(EntityType::Devices, &identity).unwrap());
        assert!(!store.delete_raw(EntityType::Devices, &identity).unwrap());
    }

    #[test]
    fn test_field_catalogue_merges() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first: BTreeSet<String> = ["id", "hostname"].iter().map(|s| s.to_string()).collect();
        let second: BTreeSet<String> = ["hostname", "ip"].iter().map(|s| s.to_string()).collect();
        store
            .save_field_names(EntityType::Devices, "ad1_adapter_0", &first)
            .unwrap();
        store
            .save_field_names(EntityType::Devices, "ad1_adapter_0", &second)
            .unwrap();
        let loaded = store
            .load_field_names(EntityType::Devices, "ad1_adapter_0")
            .unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[test]
    fn test_entities_missing_pretty_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = plugin(1);
        let mut with_id = member(&p, "dev1");
        with_id.data.insert("pretty_id".into(), json!("AX-1"));
        store
            .insert_entity(EntityType::Devices, &MergedEntity::for_single(with_id))
            .unwrap();
        store
            .insert_entity(EntityType::Devices, &single(&p, "dev2"))
            .unwrap();

        let missing = store
            .entities_missing_pretty_id(EntityType::Devices, &p.plugin_unique_name)
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].adapters[0].native_id(), "dev2");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_entity(EntityType::Devices, &single(&plugin(1), "dev1"))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_entities(EntityType::Devices).unwrap(), 1);
    }
}
