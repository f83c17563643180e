//! Entity ingestion pipeline.
//!
//! Consumes a batch of parsed adapter records for one client/adapter pair.
//! A known-empty collection takes the bulk fast path; otherwise every record
//! goes through a per-identity-locked upsert-or-insert on the blocking pool,
//! with stale-write rejection when last-seen prioritization is enabled.
//! Per-record failures are logged and skipped; partial success is the norm
//! for bulk ingestion, not an error state.

use super::CorrelationEngine;
use crate::entity::{
    recalculate_oldness, AdapterEntity, AdapterEntityOrigin, AdapterIdentity, EntityType,
    MergedEntity, PluginIdentity, QuickId, IGNORE_RECORD,
};
use crate::storage::{EntityOps, MemberUpdate, StorageError, StorageResult};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Fast-path bulk insert chunk size.
const INSERT_CHUNK: usize = 500;
/// How often the outstanding-task list is pruned.
const PRUNE_INTERVAL: usize = 1000;
/// Admission-control valve: above this many outstanding per-record tasks
/// the pipeline sleep-polls instead of queueing more.
const MAX_OUTSTANDING: usize = 2000;
/// How often the field-name catalogue is persisted mid-batch.
const FIELD_FLUSH_INTERVAL: usize = 10_000;
/// Ceiling on waiting for a whole batch to settle. Elapsing it is logged,
/// never raised.
const BATCH_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const BACKPRESSURE_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("ingestion task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// One record after preprocessing: raw payload popped to the side store,
/// `correlates` resolved into an explicit origin.
struct PreparedRecord {
    entity: AdapterEntity,
    raw: Option<Value>,
    origin: AdapterEntityOrigin,
    fetch_time: Option<Value>,
}

enum Disposition {
    Save(PreparedRecord),
    Ignore(AdapterEntity),
}

fn prepare_record(
    client_used: Option<String>,
    plugin: &PluginIdentity,
    mut data: Map<String, Value>,
) -> Disposition {
    let raw = data.remove("raw");
    let origin = match data.remove("correlates") {
        Some(Value::String(s)) if s == IGNORE_RECORD => {
            return Disposition::Ignore(AdapterEntity::new(client_used, plugin, data));
        }
        Some(Value::Object(target)) => {
            let plugin_unique_name = target.get("plugin_unique_name").and_then(|v| v.as_str());
            let native_id = target.get("id").and_then(|v| v.as_str());
            match (plugin_unique_name, native_id) {
                (Some(p), Some(i)) => {
                    AdapterEntityOrigin::CorrelatesWith(AdapterIdentity::new(p, i))
                }
                _ => {
                    warn!("malformed correlates target, treating record as first seen");
                    AdapterEntityOrigin::FirstSeen
                }
            }
        }
        _ => AdapterEntityOrigin::FirstSeen,
    };
    let fetch_time = data.get("fetch_time").cloned();
    Disposition::Save(PreparedRecord {
        entity: AdapterEntity::new(client_used, plugin, data),
        raw,
        origin,
        fetch_time,
    })
}

impl PreparedRecord {
    /// Value for `first_fetch_time` on first insert: the record's fetch
    /// time when it carries one, otherwise the ingestion timestamp.
    fn first_fetch_value(&self) -> Value {
        self.fetch_time
            .clone()
            .unwrap_or_else(|| Value::String(self.entity.accurate_for_datetime.to_rfc3339()))
    }
}

impl CorrelationEngine {
    /// Ingest one batch of parsed records. Returns how many records were
    /// written (updated, appended, or inserted); stale and ignored records
    /// are not counted.
    pub async fn save_adapter_entities(
        self: Arc<Self>,
        client_name: Option<String>,
        records: Vec<Map<String, Value>>,
        entity_type: EntityType,
        plugin: PluginIdentity,
    ) -> IngestResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let total = records.len();
        info!(
            "ingesting {total} {entity_type} records from {}",
            plugin.plugin_unique_name
        );

        let fast_path = self.bulk_fast_path_armed(&plugin.plugin_unique_name)
            && !self.settings.last_seen_prioritized
            && !self
                .store
                .plugin_has_members(entity_type, &plugin.plugin_unique_name)?;

        let written = Arc::new(AtomicUsize::new(0));
        let outcome = if fast_path {
            self.clone()
                .ingest_bulk(client_name, records, entity_type, plugin.clone(), &written)
                .await
        } else {
            self.clone()
                .ingest_incremental(client_name, records, entity_type, plugin.clone(), &written)
                .await
        };
        // This connection's collection is no longer known-empty, whatever
        // happened.
        self.mark_plugin_ingested(&plugin.plugin_unique_name);
        outcome?;

        let engine = Arc::clone(&self);
        let plugin_unique_name = plugin.plugin_unique_name.clone();
        task::spawn_blocking(move || {
            if let Err(e) = engine.fields.flush(engine.store.as_ref()) {
                warn!("failed to persist field catalogue: {e}");
            }
            if entity_type == EntityType::Devices {
                if let Err(e) =
                    engine.add_pretty_ids_to_missing(entity_type, &plugin_unique_name)
                {
                    warn!("failed to assign pretty ids: {e}");
                }
            }
        })
        .await?;

        let count = written.load(Ordering::SeqCst);
        info!(
            "ingested {count}/{total} {entity_type} records from {}",
            plugin.plugin_unique_name
        );
        Ok(count)
    }

    /// Bulk insert for a known-empty collection. Duplicates within the
    /// batch are logged and skipped, never fatal (unordered semantics).
    async fn ingest_bulk(
        self: Arc<Self>,
        client_name: Option<String>,
        mut records: Vec<Map<String, Value>>,
        entity_type: EntityType,
        plugin: PluginIdentity,
        written: &Arc<AtomicUsize>,
    ) -> IngestResult<()> {
        debug!("empty collection, taking the bulk insert path");
        let mut handles = Vec::new();
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(INSERT_CHUNK));
            let chunk = std::mem::replace(&mut records, rest);
            let engine = Arc::clone(&self);
            let client = client_name.clone();
            let chunk_plugin = plugin.clone();
            let counter = Arc::clone(written);
            handles.push(task::spawn_blocking(move || {
                engine.ingest_chunk(client, chunk, entity_type, &chunk_plugin, &counter);
            }));
        }
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    fn ingest_chunk(
        &self,
        client_name: Option<String>,
        chunk: Vec<Map<String, Value>>,
        entity_type: EntityType,
        plugin: &PluginIdentity,
        written: &AtomicUsize,
    ) {
        let mut docs = Vec::with_capacity(chunk.len());
        for data in chunk {
            self.fields.record(entity_type, &plugin.plugin_unique_name, &data);
            match prepare_record(client_name.clone(), plugin, data) {
                Disposition::Ignore(entity) => {
                    if let Err(e) = self.store.save_ignored_record(entity_type, &entity) {
                        warn!("failed to park ignored record: {e}");
                    }
                }
                Disposition::Save(prepared) if prepared.origin == AdapterEntityOrigin::FirstSeen => {
                    if let Some(raw) = &prepared.raw {
                        if let Err(e) =
                            self.store
                                .upsert_raw(entity_type, &prepared.entity.identity(), raw)
                        {
                            warn!("failed to store raw payload: {e}");
                        }
                    }
                    let mut entity = prepared.entity.clone();
                    entity
                        .data
                        .insert("first_fetch_time".to_string(), prepared.first_fetch_value());
                    let mut doc = MergedEntity::for_single(entity);
                    recalculate_oldness(&mut doc.adapters, entity_type);
                    docs.push(doc);
                }
                // Scanner correlates still need the locked slow path even
                // when the adapter's own collection is empty.
                Disposition::Save(prepared) => match self.ingest_one(entity_type, &prepared) {
                    Ok(true) => {
                        written.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(
                            "failed to ingest correlate record {}: {e}",
                            prepared.entity.quick_id
                        );
                    }
                },
            }
        }
        match self.store.insert_entities(entity_type, &docs) {
            Ok(outcome) => {
                written.fetch_add(outcome.inserted, Ordering::SeqCst);
            }
            Err(e) => error!("bulk insert chunk failed: {e}"),
        }
    }

    /// Per-record locked upsert-or-insert with backpressure.
    async fn ingest_incremental(
        self: Arc<Self>,
        client_name: Option<String>,
        records: Vec<Map<String, Value>>,
        entity_type: EntityType,
        plugin: PluginIdentity,
        written: &Arc<AtomicUsize>,
    ) -> IngestResult<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for (i, data) in records.into_iter().enumerate() {
            self.fields.record(entity_type, &plugin.plugin_unique_name, &data);
            let disposition = prepare_record(client_name.clone(), &plugin, data);
            let engine = Arc::clone(&self);
            let counter = Arc::clone(written);
            handles.push(task::spawn_blocking(move || match disposition {
                Disposition::Ignore(entity) => {
                    if let Err(e) = engine.store.save_ignored_record(entity_type, &entity) {
                        warn!("failed to park ignored record: {e}");
                    }
                }
                Disposition::Save(prepared) => {
                    match engine.ingest_one(entity_type, &prepared) {
                        Ok(true) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(
                                "failed to ingest record {}: {e}",
                                prepared.entity.quick_id
                            );
                        }
                    }
                }
            }));

            if (i + 1) % PRUNE_INTERVAL == 0 {
                handles.retain(|h| !h.is_finished());
                while handles.len() > MAX_OUTSTANDING {
                    tokio::time::sleep(BACKPRESSURE_POLL).await;
                    handles.retain(|h| !h.is_finished());
                }
            }
            if (i + 1) % FIELD_FLUSH_INTERVAL == 0 {
                let engine = Arc::clone(&self);
                task::spawn_blocking(move || {
                    if let Err(e) = engine.fields.flush(engine.store.as_ref()) {
                        warn!("mid-batch field catalogue flush failed: {e}");
                    }
                })
                .await?;
            }
        }

        let settle = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("ingestion task panicked: {e}");
                }
            }
        };
        if tokio::time::timeout(BATCH_TIMEOUT, settle).await.is_err() {
            error!(
                "ingestion batch did not settle within {:?}, proceeding",
                BATCH_TIMEOUT
            );
        }
        Ok(())
    }

    /// Upsert-or-insert one record under its identity lock. Returns whether
    /// the record landed (false for stale drops and lost insert races).
    fn ingest_one(&self, entity_type: EntityType, prepared: &PreparedRecord) -> StorageResult<bool> {
        let mut keys: Vec<QuickId> = vec![prepared.entity.quick_id.clone()];
        let correlate_target = match &prepared.origin {
            AdapterEntityOrigin::CorrelatesWith(target) => {
                keys.push(target.quick_id());
                Some(target.clone())
            }
            AdapterEntityOrigin::FirstSeen => None,
        };
        let _guard = self.locks.acquire(&keys);

        self.with_retries("ingest record", || {
            if let Some(raw) = &prepared.raw {
                self.store
                    .upsert_raw(entity_type, &prepared.entity.identity(), raw)?;
            }
            match self.store.update_member_guarded(
                entity_type,
                &prepared.entity,
                self.settings.last_seen_prioritized,
            )? {
                MemberUpdate::Updated => Ok(true),
                MemberUpdate::Stale => {
                    warn!(
                        "dropping stale record {} (existing member is newer)",
                        prepared.entity.quick_id
                    );
                    Ok(false)
                }
                MemberUpdate::NoMatch => {
                    let mut entity = prepared.entity.clone();
                    entity
                        .data
                        .insert("first_fetch_time".to_string(), prepared.first_fetch_value());

                    if let Some(target) = &correlate_target {
                        if self
                            .store
                            .append_member(entity_type, &target.quick_id(), &entity)?
                        {
                            return Ok(true);
                        }
                        warn!("correlates target {target} not found, inserting standalone");
                    }

                    let mut doc = MergedEntity::for_single(entity);
                    recalculate_oldness(&mut doc.adapters, entity_type);
                    match self.store.insert_entity(entity_type, &doc) {
                        Ok(()) => Ok(true),
                        Err(StorageError::DuplicateKey(key)) => {
                            // Another writer won the first-insert race.
                            warn!("lost insert race for {key}");
                            Ok(false)
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        })
    }
}
