//! Per-plugin field-name catalogue.
//!
//! Downstream consumers discover which free-form fields an adapter
//! produces from a persisted catalogue rather than by scanning documents.
//! Names accumulate in process during ingestion and are flushed
//! periodically; the catalogue is additive only.

use crate::entity::EntityType;
use crate::storage::{EntityOps, EntityStore, StorageResult};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Default)]
pub struct FieldCatalogue {
    seen: DashMap<(EntityType, String), BTreeSet<String>>,
}

impl FieldCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the top-level field names of one parsed record.
    pub fn record(&self, entity_type: EntityType, plugin_unique_name: &str, data: &Map<String, Value>) {
        let mut entry = self
            .seen
            .entry((entity_type, plugin_unique_name.to_string()))
            .or_default();
        for key in data.keys() {
            if !entry.contains(key) {
                entry.insert(key.clone());
            }
        }
    }

    /// Persist everything accumulated so far. Idempotent; entries are kept
    /// in memory so repeated flushes are cheap upserts.
    pub fn flush(&self, store: &dyn EntityStore) -> StorageResult<()> {
        for entry in self.seen.iter() {
            let (entity_type, plugin_unique_name) = entry.key();
            store.save_field_names(*entity_type, plugin_unique_name, entry.value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};
    use crate::storage::EntityOps as _;
    use serde_json::json;

    fn record_of(keys: &[&str]) -> Map<String, Value> {
        keys.iter().map(|k| (k.to_string(), json!(1))).collect()
    }

    #[test]
    fn test_catalogue_accumulates_and_flushes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let catalogue = FieldCatalogue::new();
        catalogue.record(EntityType::Devices, "ad_adapter_0", &record_of(&["id", "hostname"]));
        catalogue.record(EntityType::Devices, "ad_adapter_0", &record_of(&["id", "ip"]));
        catalogue.record(EntityType::Users, "ad_adapter_0", &record_of(&["id", "mail"]));

        catalogue.flush(&store).unwrap();
        catalogue.flush(&store).unwrap();

        let devices = store
            .load_field_names(EntityType::Devices, "ad_adapter_0")
            .unwrap();
        assert_eq!(devices.len(), 3);
        let users = store
            .load_field_names(EntityType::Users, "ad_adapter_0")
            .unwrap();
        assert!(users.contains("mail"));
    }
}
