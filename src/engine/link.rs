//! Link/unlink correlation core.
//!
//! Link merges N merged entities known to be the same real-world entity:
//! members are unioned, oldness recomputed, tags deduplicated by owner,
//! labels unioned, and a reason appended to the audit trail. Unlink splits
//! one adapter entity out into its own document, partitioning tags by which
//! member adapters motivated them. Both run inside a single store session
//! so the multi-document rewrite is all-or-nothing.

use super::retry::Transient;
use super::CorrelationEngine;
use crate::entity::{
    recalculate_oldness, AdapterIdentity, EntityType, InternalAxonId, MergedEntity, QuickId, Tag,
    TagAction,
};
use crate::storage::{EntityOps, StorageError};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info, warn};

/// Merged entities above this member count are logged as suspicious.
const OVERSIZE_TOTAL: usize = 30;
/// More members than this from one plugin_unique_name is logged as
/// suspicious.
const OVERSIZE_PER_PLUGIN: usize = 10;

/// A correlation decision produced by an external correlator: which adapter
/// entities belong together, and why.
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    pub associated_adapters: Vec<AdapterIdentity>,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("nothing to merge: {found} candidate(s) resolved")]
    TooFewCandidates { found: usize },

    #[error("refusing to merge {found} candidates (ceiling {max})")]
    TooManyCandidates { found: usize, max: usize },

    #[error("no merged entity contains adapter entity {0}")]
    NotFound(AdapterIdentity),

    #[error("cannot split the only member out of {0}")]
    SingleMember(InternalAxonId),

    #[error("malformed merged entity {0}")]
    Malformed(InternalAxonId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CorrelateResult<T> = Result<T, CorrelateError>;

impl Transient for CorrelateError {
    fn is_transient(&self) -> bool {
        matches!(self, CorrelateError::Storage(e) if e.is_transient())
    }
}

/// Collapse tags collected from several merged entities: group by
/// `(plugin_unique_name, name)`, keep the newest of each group, except
/// merge-policy tags whose data arrays concatenate across the whole group.
fn dedup_tags(tags: Vec<Tag>) -> Vec<Tag> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<Tag>> = HashMap::new();
    for tag in tags {
        let key = (tag.plugin_unique_name.clone(), tag.name.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(tag);
    }
    order
        .into_iter()
        .map(|key| collapse_group(groups.remove(&key).expect("group recorded above")))
        .collect()
}

fn collapse_group(mut group: Vec<Tag>) -> Tag {
    let newest = group
        .iter()
        .enumerate()
        .max_by_key(|(_, t)| t.accurate_for_datetime)
        .map(|(i, _)| i)
        .expect("group is non-empty");
    if group[newest].action_if_exists != TagAction::Merge {
        return group.swap_remove(newest);
    }
    // Union wins over newest-wins for merge-policy tags.
    let mut combined = Vec::new();
    for tag in &group {
        match &tag.data {
            Value::Array(items) => combined.extend(items.iter().cloned()),
            Value::Null => {}
            other => combined.push(other.clone()),
        }
    }
    let mut kept = group.swap_remove(newest);
    kept.data = Value::Array(combined);
    kept
}

impl CorrelationEngine {
    /// Merge all merged entities owning any adapter entity named by the
    /// correlation (or by an explicit candidate hint) into one surviving
    /// document. Returns the survivor's internal axon id.
    pub fn link_adapters(
        &self,
        entity_type: EntityType,
        correlation: &CorrelationResult,
        candidates_hint: Option<&[InternalAxonId]>,
    ) -> CorrelateResult<InternalAxonId> {
        self.with_retries("link_adapters", || {
            let session = self.store.session()?;
            let mut candidates = match candidates_hint {
                Some(ids) => session.find_by_internal_axon_ids(entity_type, ids)?,
                None => {
                    let quick_ids: Vec<QuickId> = correlation
                        .associated_adapters
                        .iter()
                        .map(AdapterIdentity::quick_id)
                        .collect();
                    session.find_by_quick_ids(entity_type, &quick_ids)?
                }
            };

            if candidates.len() < 2 {
                return Err(CorrelateError::TooFewCandidates {
                    found: candidates.len(),
                });
            }
            if candidates.len() > self.settings.max_link_amount {
                let ids: Vec<&str> = candidates
                    .iter()
                    .map(|c| c.internal_axon_id.as_str())
                    .collect();
                error!(
                    candidates = ?ids,
                    "link resolved {} candidates, above the {} ceiling",
                    candidates.len(),
                    self.settings.max_link_amount
                );
                return Err(CorrelateError::TooManyCandidates {
                    found: candidates.len(),
                    max: self.settings.max_link_amount,
                });
            }
            if let Some(empty) = candidates.iter().find(|c| c.adapters.is_empty()) {
                return Err(CorrelateError::Malformed(empty.internal_axon_id.clone()));
            }

            let mut merged_ids: Vec<String> = candidates
                .iter()
                .map(|c| c.internal_axon_id.to_string())
                .collect();
            merged_ids.sort();

            // Survivor: most members, ties broken by smallest id so the
            // outcome is deterministic.
            candidates.sort_by(|a, b| {
                b.adapters
                    .len()
                    .cmp(&a.adapters.len())
                    .then_with(|| a.internal_axon_id.cmp(&b.internal_axon_id))
            });
            let mut survivor = candidates.remove(0);
            let removed_ids: Vec<InternalAxonId> = candidates
                .iter()
                .map(|c| c.internal_axon_id.clone())
                .collect();

            let mut tags = std::mem::take(&mut survivor.tags);
            for mut other in candidates {
                survivor.adapters.append(&mut other.adapters);
                tags.append(&mut other.tags);
                survivor.labels.extend(other.labels);
                survivor.has_notes |= other.has_notes;
                for reason in other.correlation_reasons {
                    if !survivor.correlation_reasons.contains(&reason) {
                        survivor.correlation_reasons.push(reason);
                    }
                }
            }

            recalculate_oldness(&mut survivor.adapters, entity_type);
            survivor.tags = dedup_tags(tags);
            survivor.refresh_adapter_list_length();

            let reason = format!("{} [{}]", correlation.reason, merged_ids.join(", "));
            if !survivor.correlation_reasons.contains(&reason) {
                survivor.correlation_reasons.push(reason);
            }
            survivor.accurate_for_datetime = Utc::now();

            self.log_oversize(&survivor);

            session.delete_entities(entity_type, &removed_ids)?;
            session.replace_entity(entity_type, &survivor)?;
            session.commit()?;
            info!(
                "linked {} entities into {}",
                removed_ids.len() + 1,
                survivor.internal_axon_id
            );
            Ok(survivor.internal_axon_id.clone())
        })
    }

    fn log_oversize(&self, entity: &MergedEntity) {
        if entity.adapters.len() > OVERSIZE_TOTAL {
            warn!(
                "entity {} has {} adapter entities after link",
                entity.internal_axon_id,
                entity.adapters.len()
            );
        }
        let mut per_plugin: HashMap<&str, usize> = HashMap::new();
        for adapter in &entity.adapters {
            *per_plugin.entry(adapter.plugin_unique_name.as_str()).or_default() += 1;
        }
        for (plugin_unique_name, count) in per_plugin {
            if count > OVERSIZE_PER_PLUGIN {
                warn!(
                    "entity {} holds {count} members from {plugin_unique_name}",
                    entity.internal_axon_id
                );
            }
        }
    }

    /// Split one adapter entity out of its merged entity into a new
    /// single-member document. Returns `(new_id, old_id)`; `old_id` may
    /// differ from the document's previous id when the extracted member was
    /// the canonical one.
    pub fn unlink_adapter(
        &self,
        entity_type: EntityType,
        identity: &AdapterIdentity,
    ) -> CorrelateResult<(InternalAxonId, InternalAxonId)> {
        let quick = identity.quick_id();
        self.with_retries("unlink_adapter", || {
            let session = self.store.session()?;
            let mut doc = session
                .find_by_quick_ids(entity_type, std::slice::from_ref(&quick))?
                .into_iter()
                .next()
                .ok_or_else(|| CorrelateError::NotFound(identity.clone()))?;
            let idx = doc
                .member_index(identity)
                .ok_or_else(|| CorrelateError::NotFound(identity.clone()))?;
            if doc.adapters.len() == 1 {
                return Err(CorrelateError::SingleMember(doc.internal_axon_id.clone()));
            }

            let extracted = doc.adapters.remove(idx);
            let previous_id = doc.internal_axon_id.clone();
            let new_id = extracted.preferred_internal_axon_id();
            if new_id == doc.internal_axon_id {
                // The canonical id follows the preferred member across the
                // split; the remainder document gets a fresh id derived from
                // one of its surviving members.
                doc.internal_axon_id = doc.adapters[0].preferred_internal_axon_id();
            }

            // Partition tags. A tag motivated by the extracted member moves
            // (narrowed to just that association); it also stays behind when
            // any other association survives, so a tag can land on both.
            let mut moved = Vec::new();
            let mut kept = Vec::new();
            for tag in std::mem::take(&mut doc.tags) {
                let matches_extracted =
                    tag.associated_adapters.iter().any(|a| a == identity);
                if matches_extracted {
                    let mut clone = tag.clone();
                    clone.associated_adapters = vec![identity.clone()];
                    moved.push(clone);
                }
                let fully_moved = !tag.associated_adapters.is_empty()
                    && tag.associated_adapters.iter().all(|a| a == identity);
                if !fully_moved {
                    kept.push(tag);
                }
            }
            doc.tags = kept;

            let mut split = MergedEntity::for_single(extracted);
            split.tags = moved;
            split.refresh_has_notes();
            split.refresh_adapter_list_length();
            recalculate_oldness(&mut split.adapters, entity_type);

            recalculate_oldness(&mut doc.adapters, entity_type);
            doc.refresh_adapter_list_length();
            doc.refresh_has_notes();
            doc.accurate_for_datetime = Utc::now();

            session.replace_entity_reidentified(entity_type, &previous_id, &doc)?;
            session.insert_entity(entity_type, &split)?;
            session.commit()?;
            info!(
                "unlinked {identity} out of {previous_id} into {}",
                split.internal_axon_id
            );
            Ok((split.internal_axon_id.clone(), doc.internal_axon_id.clone()))
        })
    }

    /// Remove one adapter entity entirely: unlink it into its own document
    /// first when it has siblings, then archive and hard-delete that
    /// document along with its raw side record.
    pub fn delete_adapter_entity(
        &self,
        entity_type: EntityType,
        identity: &AdapterIdentity,
    ) -> CorrelateResult<()> {
        let quick = identity.quick_id();
        let doc = crate::storage::find_by_quick_id(self.store.as_ref(), entity_type, &quick)?
            .ok_or_else(|| CorrelateError::NotFound(identity.clone()))?;
        if doc.adapters.len() > 1 {
            self.unlink_adapter(entity_type, identity)?;
        }

        let removed = self
            .with_retries("delete_adapter_entity", || {
                self.store.find_and_delete_by_quick_id(entity_type, &quick)
            })?
            .ok_or_else(|| CorrelateError::NotFound(identity.clone()))?;

        // The delete has committed; archival failure must not undo it.
        if let Err(e) = self.store.archive_entity(entity_type, &removed) {
            error!(
                "failed to archive {} after deletion: {e}",
                removed.internal_axon_id
            );
        }
        self.store.delete_raw(entity_type, identity)?;
        info!("deleted adapter entity {identity}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::entity::{AdapterEntity, PluginIdentity, TagType};
    use crate::storage::{OpenStore, SqliteStore};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Arc;

    fn engine() -> CorrelationEngine {
        engine_with(EngineSettings::default())
    }

    fn engine_with(settings: EngineSettings) -> CorrelationEngine {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        CorrelationEngine::new(store, settings)
    }

    fn plugin(name: &str) -> PluginIdentity {
        PluginIdentity::new("Adapter", name, format!("{name}_adapter_0"))
    }

    fn seed(engine: &CorrelationEngine, plugin: &PluginIdentity, native_id: &str) -> AdapterIdentity {
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(native_id));
        let entity = AdapterEntity::new(None, plugin, data);
        let identity = entity.identity();
        engine
            .store()
            .insert_entity(EntityType::Devices, &MergedEntity::for_single(entity))
            .unwrap();
        identity
    }

    fn correlation(ids: &[&AdapterIdentity]) -> CorrelationResult {
        CorrelationResult {
            associated_adapters: ids.iter().map(|i| (*i).clone()).collect(),
            reason: "logic/hostname".to_string(),
        }
    }

    fn find(engine: &CorrelationEngine, identity: &AdapterIdentity) -> MergedEntity {
        crate::storage::find_by_quick_id(engine.store(), EntityType::Devices, &identity.quick_id())
            .unwrap()
            .unwrap()
    }

    fn tag_named(name: &str, pun: &str, assoc: &[AdapterIdentity], action: TagAction) -> Tag {
        Tag {
            association_type: "Tag".into(),
            associated_adapters: assoc.to_vec(),
            name: name.into(),
            data: json!([{"v": name}]),
            tag_type: TagType::Data,
            action_if_exists: action,
            plugin_unique_name: pun.into(),
            plugin_name: pun.into(),
            client_used: None,
            associated_adapter_plugin_name: None,
            accurate_for_datetime: Utc::now(),
        }
    }

    #[test]
    fn test_link_merge_conservation() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");

        let survivor = engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 1);
        let doc = find(&engine, &a);
        assert_eq!(doc.internal_axon_id, survivor);
        assert_eq!(doc.adapters.len(), 2);
        assert_eq!(doc.adapter_list_length, 2);
        assert_eq!(doc.correlation_reasons.len(), 1);
        assert!(doc.correlation_reasons[0].starts_with("logic/hostname"));
    }

    #[test]
    fn test_link_too_few_candidates() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let err = engine
            .link_adapters(EntityType::Devices, &correlation(&[&a]), None)
            .unwrap_err();
        assert!(matches!(err, CorrelateError::TooFewCandidates { found: 1 }));
    }

    #[test]
    fn test_link_ceiling_leaves_store_untouched() {
        let engine = engine_with(EngineSettings {
            max_link_amount: 2,
            ..EngineSettings::default()
        });
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        let c = seed(&engine, &plugin("aws"), "i-1");

        let err = engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b, &c]), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CorrelateError::TooManyCandidates { found: 3, max: 2 }
        ));
        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 3);
    }

    #[test]
    fn test_link_survivor_tie_break_deterministic() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");

        let expected = find(&engine, &a)
            .internal_axon_id
            .min(find(&engine, &b).internal_axon_id);
        let survivor = engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();
        assert_eq!(survivor, expected);
    }

    #[test]
    fn test_link_by_candidate_hint() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        let hint = [
            find(&engine, &a).internal_axon_id,
            find(&engine, &b).internal_axon_id,
        ];

        engine
            .link_adapters(EntityType::Devices, &correlation(&[]), Some(&hint))
            .unwrap();
        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 1);
    }

    #[test]
    fn test_link_carried_reasons_deduplicated() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");

        let shared = "carried-over reason".to_string();
        for identity in [&a, &b] {
            let mut doc = find(&engine, identity);
            doc.correlation_reasons.push(shared.clone());
            engine
                .store()
                .replace_entity(EntityType::Devices, &doc)
                .unwrap();
        }

        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();
        let doc = find(&engine, &a);
        let carried = doc
            .correlation_reasons
            .iter()
            .filter(|r| **r == shared)
            .count();
        assert_eq!(carried, 1);
    }

    #[test]
    fn test_link_tag_dedup_newest_wins() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");

        let mut doc_a = find(&engine, &a);
        let mut old_tag = tag_named("scan", "gui_0", &[a.clone()], TagAction::Replace);
        old_tag.accurate_for_datetime = Utc::now() - ChronoDuration::hours(1);
        old_tag.data = json!("old");
        doc_a.tags.push(old_tag);
        engine
            .store()
            .replace_entity(EntityType::Devices, &doc_a)
            .unwrap();

        let mut doc_b = find(&engine, &b);
        let mut new_tag = tag_named("scan", "gui_0", &[b.clone()], TagAction::Replace);
        new_tag.data = json!("new");
        doc_b.tags.push(new_tag);
        engine
            .store()
            .replace_entity(EntityType::Devices, &doc_b)
            .unwrap();

        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();
        let doc = find(&engine, &a);
        assert_eq!(doc.tags.len(), 1);
        assert_eq!(doc.tags[0].data, json!("new"));
    }

    #[test]
    fn test_link_merge_policy_tags_concatenate() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");

        let mut doc_a = find(&engine, &a);
        let mut t = tag_named("Notes", "gui_0", &[a.clone()], TagAction::Merge);
        t.data = json!([{"note": "one"}]);
        doc_a.tags.push(t);
        engine
            .store()
            .replace_entity(EntityType::Devices, &doc_a)
            .unwrap();

        let mut doc_b = find(&engine, &b);
        let mut t = tag_named("Notes", "gui_0", &[b.clone()], TagAction::Merge);
        t.data = json!([{"note": "two"}]);
        doc_b.tags.push(t);
        engine
            .store()
            .replace_entity(EntityType::Devices, &doc_b)
            .unwrap();

        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();
        let doc = find(&engine, &a);
        assert_eq!(doc.tags.len(), 1);
        let notes = doc.tags[0].data.as_array().unwrap();
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn test_unlink_split_conservation() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        let (new_id, old_id) = engine.unlink_adapter(EntityType::Devices, &b).unwrap();
        assert_ne!(new_id, old_id);
        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 2);

        let split = find(&engine, &b);
        assert_eq!(split.internal_axon_id, new_id);
        assert_eq!(split.adapters.len(), 1);
        let remainder = find(&engine, &a);
        assert_eq!(remainder.internal_axon_id, old_id);
        assert_eq!(remainder.adapters.len(), 1);
    }

    #[test]
    fn test_unlink_canonical_id_handoff() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        let survivor = engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        // Extract whichever member the canonical id was derived from.
        let doc = find(&engine, &a);
        let preferred = doc
            .adapters
            .iter()
            .find(|m| m.preferred_internal_axon_id() == survivor)
            .expect("one member is canonical")
            .identity();

        let (new_id, old_id) = engine
            .unlink_adapter(EntityType::Devices, &preferred)
            .unwrap();
        assert_eq!(new_id, survivor);
        assert_ne!(old_id, survivor);
    }

    #[test]
    fn test_unlink_single_member_rejected() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let err = engine.unlink_adapter(EntityType::Devices, &a).unwrap_err();
        assert!(matches!(err, CorrelateError::SingleMember(_)));
    }

    #[test]
    fn test_unlink_partitions_tags() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        let mut doc = find(&engine, &a);
        doc.tags.push(tag_named("only-b", "gui_0", &[b.clone()], TagAction::Replace));
        doc.tags.push(tag_named(
            "both",
            "gui_0",
            &[a.clone(), b.clone()],
            TagAction::Replace,
        ));
        doc.tags.push(tag_named("only-a", "gui_0", &[a.clone()], TagAction::Replace));
        engine
            .store()
            .replace_entity(EntityType::Devices, &doc)
            .unwrap();

        engine.unlink_adapter(EntityType::Devices, &b).unwrap();

        let split = find(&engine, &b);
        let split_names: Vec<&str> = split.tags.iter().map(|t| t.name.as_str()).collect();
        assert!(split_names.contains(&"only-b"));
        assert!(split_names.contains(&"both"));
        assert!(!split_names.contains(&"only-a"));
        // The moved copy forgets associations that did not travel with it.
        let both = split.tags.iter().find(|t| t.name == "both").unwrap();
        assert_eq!(both.associated_adapters, vec![b.clone()]);

        let remainder = find(&engine, &a);
        let kept_names: Vec<&str> = remainder.tags.iter().map(|t| t.name.as_str()).collect();
        assert!(kept_names.contains(&"only-a"));
        assert!(kept_names.contains(&"both"));
        assert!(!kept_names.contains(&"only-b"));
    }

    #[test]
    fn test_link_after_unlink_round_trip() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();
        engine.unlink_adapter(EntityType::Devices, &b).unwrap();
        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 1);
        let doc = find(&engine, &a);
        assert_eq!(doc.adapters.len(), 2);
    }

    #[test]
    fn test_delete_adapter_entity_with_siblings() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        let b = seed(&engine, &plugin("esx"), "vm1");
        engine
            .link_adapters(EntityType::Devices, &correlation(&[&a, &b]), None)
            .unwrap();

        engine.delete_adapter_entity(EntityType::Devices, &b).unwrap();
        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 1);
        let doc = find(&engine, &a);
        assert_eq!(doc.adapters.len(), 1);
        assert!(crate::storage::find_by_quick_id(
            engine.store(),
            EntityType::Devices,
            &b.quick_id()
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn test_delete_last_member_removes_document() {
        let engine = engine();
        let a = seed(&engine, &plugin("ad"), "dev1");
        engine.delete_adapter_entity(EntityType::Devices, &a).unwrap();
        assert_eq!(engine.store().count_entities(EntityType::Devices).unwrap(), 0);
    }

    #[test]
    fn test_delete_missing_entity_rejected() {
        let engine = engine();
        let ghost = AdapterIdentity::new("ad_adapter_0", "never-seen");
        let err = engine
            .delete_adapter_entity(EntityType::Devices, &ghost)
            .unwrap_err();
        assert!(matches!(err, CorrelateError::NotFound(_)));
    }
}
