//! Pretty-ID allocation.
//!
//! Human-readable sequential IDs (`AX-{n}`) are handed to device members
//! after ingestion. The counter lives in storage and is incremented by N in
//! one atomic step, so concurrent allocators receive disjoint ranges.

use super::CorrelationEngine;
use crate::entity::{EntityType, QuickId};
use crate::storage::{EntityOps, StorageResult};
use tracing::debug;

/// Name of the persisted counter backing pretty-ID issuance.
pub const PRETTY_ID_COUNTER: &str = "pretty_id";

pub fn format_pretty_id(n: u64) -> String {
    format!("AX-{n}")
}

impl CorrelationEngine {
    /// Reserve `count` sequential pretty IDs in one counter increment.
    pub fn allocate_pretty_ids(&self, count: u64) -> StorageResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = self.store.increment_counter(PRETTY_ID_COUNTER, count)?;
        let start = end - count + 1;
        Ok((start..=end).map(format_pretty_id).collect())
    }

    /// Assign pretty IDs to every member of `plugin_unique_name` that lacks
    /// one. Returns the number of members stamped.
    pub fn add_pretty_ids_to_missing(
        &self,
        entity_type: EntityType,
        plugin_unique_name: &str,
    ) -> StorageResult<usize> {
        let candidates = self
            .store
            .entities_missing_pretty_id(entity_type, plugin_unique_name)?;

        let mut stamped = 0;
        for snapshot in candidates {
            let member_keys: Vec<QuickId> = snapshot
                .adapters
                .iter()
                .filter(|a| a.plugin_unique_name == plugin_unique_name)
                .map(|a| a.quick_id.clone())
                .collect();
            if member_keys.is_empty() {
                continue;
            }

            // The scan ran unlocked, so the snapshot may already be stale.
            // Stamp against a fresh read taken under the members' identity
            // locks, the same discipline every ingestion write follows.
            let _guard = self.locks.acquire(&member_keys);
            let mut fresh = self.store.find_by_quick_ids(entity_type, &member_keys)?;
            for doc in &mut fresh {
                let missing = doc
                    .adapters
                    .iter()
                    .filter(|a| {
                        a.plugin_unique_name == plugin_unique_name
                            && !a.data.contains_key("pretty_id")
                    })
                    .count() as u64;
                if missing == 0 {
                    continue;
                }
                let mut ids = self.allocate_pretty_ids(missing)?.into_iter();
                for adapter in &mut doc.adapters {
                    if adapter.plugin_unique_name == plugin_unique_name
                        && !adapter.data.contains_key("pretty_id")
                    {
                        let id = ids.next().expect("range sized to missing count");
                        adapter
                            .data
                            .insert("pretty_id".to_string(), serde_json::Value::String(id));
                        stamped += 1;
                    }
                }
                self.store.replace_entity(entity_type, doc)?;
            }
        }
        debug!("assigned {stamped} pretty ids for {plugin_unique_name}");
        Ok(stamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::entity::{AdapterEntity, AdapterIdentity, MergedEntity, PluginIdentity};
    use crate::storage::{find_by_quick_id, OpenStore, SqliteStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn engine() -> CorrelationEngine {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        CorrelationEngine::new(store, EngineSettings::default())
    }

    fn insert_device(engine: &CorrelationEngine, pun: &str, native_id: &str) {
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(native_id));
        let plugin = PluginIdentity::new("Adapter", "ad", pun);
        let entity = AdapterEntity::new(None, &plugin, data);
        engine
            .store()
            .insert_entity(EntityType::Devices, &MergedEntity::for_single(entity))
            .unwrap();
    }

    #[test]
    fn test_allocation_ranges_disjoint() {
        let engine = engine();
        let first = engine.allocate_pretty_ids(3).unwrap();
        let second = engine.allocate_pretty_ids(2).unwrap();
        assert_eq!(first, vec!["AX-1", "AX-2", "AX-3"]);
        assert_eq!(second, vec!["AX-4", "AX-5"]);
    }

    #[test]
    fn test_missing_members_stamped_once() {
        let engine = engine();
        insert_device(&engine, "ad_adapter_0", "dev1");
        insert_device(&engine, "ad_adapter_0", "dev2");

        assert_eq!(
            engine
                .add_pretty_ids_to_missing(EntityType::Devices, "ad_adapter_0")
                .unwrap(),
            2
        );
        // Second pass finds nothing left to stamp.
        assert_eq!(
            engine
                .add_pretty_ids_to_missing(EntityType::Devices, "ad_adapter_0")
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_backfill_preserves_concurrent_member_update() {
        let engine = Arc::new(engine());
        insert_device(&engine, "ad_adapter_0", "dev1");

        let identity = AdapterIdentity::new("ad_adapter_0", "dev1");
        let quick = identity.quick_id();

        // Hold the identity lock so the backfill takes its unlocked scan
        // snapshot but cannot stamp yet.
        let guard = engine.locks.acquire(std::slice::from_ref(&quick));
        let worker = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .add_pretty_ids_to_missing(EntityType::Devices, "ad_adapter_0")
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(100));

        // An ingestion-style member update lands while the backfill waits.
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!("dev1"));
        data.insert("hostname".into(), json!("h2"));
        let plugin = PluginIdentity::new("Adapter", "ad", "ad_adapter_0");
        let incoming = AdapterEntity::new(None, &plugin, data);
        engine
            .store()
            .update_member_guarded(EntityType::Devices, &incoming, false)
            .unwrap();
        drop(guard);

        assert_eq!(worker.join().unwrap(), 1);
        let doc = find_by_quick_id(engine.store(), EntityType::Devices, &quick)
            .unwrap()
            .unwrap();
        // The backfill stamped a fresh read, not its stale snapshot.
        assert_eq!(doc.adapters[0].data["hostname"], json!("h2"));
        assert!(doc.adapters[0].data.contains_key("pretty_id"));
    }
}
