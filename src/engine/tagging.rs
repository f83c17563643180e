//! Tagging engine.
//!
//! Applies label, data, and adapterdata tags to the unique merged entity
//! containing a given set of adapter identities. A tag application must
//! resolve to exactly one merged entity; zero or several matches is a hard
//! error with no write. Tag uniqueness on `(name, plugin_unique_name,
//! type)` is enforced through the `action_if_exists` conflict policies.

use super::retry::Transient;
use super::CorrelationEngine;
use crate::entity::{
    deep_merge_maps, value_is_truthy, AdapterIdentity, EntityType, MergedEntity, PluginIdentity,
    QuickId, Tag, TagAction, TagType,
};
use crate::storage::{EntityOps, StorageError};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag must target exactly one merged entity, {found} matched")]
    AmbiguousTarget { found: usize },

    #[error("action {action:?} is not valid for tag type {tag_type:?}")]
    InvalidAction {
        action: TagAction,
        tag_type: TagType,
    },

    #[error("no member matches associated adapter {0}")]
    AssociatedAdapterMissing(AdapterIdentity),

    #[error("integrity violation: {count} tags share identity ({name}, {plugin_unique_name})")]
    IntegrityViolation {
        name: String,
        plugin_unique_name: String,
        count: usize,
    },

    #[error("tag write did not land: {0}")]
    WriteMismatch(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type TagResult<T> = Result<T, TagError>;

impl Transient for TagError {
    fn is_transient(&self) -> bool {
        matches!(self, TagError::Storage(e) if e.is_transient())
    }
}

impl CorrelationEngine {
    /// Apply one tag to the merged entity owning the given adapter
    /// identities. Returns the updated entity.
    #[allow(clippy::too_many_arguments)]
    pub fn tag(
        &self,
        entity_type: EntityType,
        identity_by_adapter: &[AdapterIdentity],
        name: &str,
        data: Value,
        tag_type: TagType,
        action_if_exists: TagAction,
        client_used: Option<String>,
        issuer: &PluginIdentity,
    ) -> TagResult<MergedEntity> {
        let valid = match action_if_exists {
            TagAction::Replace => true,
            TagAction::Update => tag_type == TagType::AdapterData,
            TagAction::Merge => tag_type == TagType::Data,
        };
        if !valid {
            return Err(TagError::InvalidAction {
                action: action_if_exists,
                tag_type,
            });
        }

        let quick_ids: Vec<QuickId> = identity_by_adapter
            .iter()
            .map(AdapterIdentity::quick_id)
            .collect();
        let _guard = self.locks.acquire(&quick_ids);

        self.with_retries("tag", || {
            let session = self.store.session()?;
            let mut docs = session.find_by_quick_ids(entity_type, &quick_ids)?;
            if docs.len() != 1 {
                return Err(TagError::AmbiguousTarget { found: docs.len() });
            }
            let mut doc = docs.pop().expect("length checked above");

            if tag_type == TagType::Label {
                if value_is_truthy(&data) {
                    doc.labels.insert(name.to_string());
                } else {
                    doc.labels.remove(name);
                }
            } else {
                self.write_tag(
                    &mut doc,
                    identity_by_adapter,
                    name,
                    data.clone(),
                    tag_type,
                    action_if_exists,
                    client_used.clone(),
                    issuer,
                )?;
            }

            doc.refresh_has_notes();
            doc.accurate_for_datetime = Utc::now();
            session
                .replace_entity(entity_type, &doc)
                .map_err(|e| match e {
                    StorageError::EntityNotFound(id) => TagError::WriteMismatch(id),
                    other => TagError::Storage(other),
                })?;
            session.commit()?;
            Ok(doc)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_tag(
        &self,
        doc: &mut MergedEntity,
        identity_by_adapter: &[AdapterIdentity],
        name: &str,
        data: Value,
        tag_type: TagType,
        action_if_exists: TagAction,
        client_used: Option<String>,
        issuer: &PluginIdentity,
    ) -> TagResult<()> {
        let associated_adapter_plugin_name = if tag_type == TagType::AdapterData {
            let first = identity_by_adapter
                .first()
                .ok_or(TagError::AmbiguousTarget { found: 0 })?;
            let member = doc
                .member(first)
                .ok_or_else(|| TagError::AssociatedAdapterMissing(first.clone()))?;
            Some(member.plugin_name.clone())
        } else {
            None
        };

        let mut tag = Tag {
            association_type: "Tag".to_string(),
            associated_adapters: identity_by_adapter.to_vec(),
            name: name.to_string(),
            data,
            tag_type,
            action_if_exists,
            plugin_unique_name: issuer.plugin_unique_name.clone(),
            plugin_name: issuer.plugin_name.clone(),
            client_used,
            associated_adapter_plugin_name,
            accurate_for_datetime: Utc::now(),
        };

        let existing: Vec<usize> = doc
            .tags
            .iter()
            .enumerate()
            .filter(|(_, t)| t.identity() == tag.identity())
            .map(|(i, _)| i)
            .collect();

        match existing.len() {
            0 => doc.tags.push(tag),
            1 => {
                let idx = existing[0];
                if action_if_exists == TagAction::Update {
                    // Dict-level deep merge; arrays are atomic replacement
                    // units. Merge-policy tags behave like replace at write
                    // time, their union happens at link.
                    let old = std::mem::take(&mut doc.tags[idx].data);
                    tag.data = deep_merge_maps(tag.data, old);
                }
                doc.tags[idx] = tag;
            }
            count => {
                return Err(TagError::IntegrityViolation {
                    name: name.to_string(),
                    plugin_unique_name: issuer.plugin_unique_name.clone(),
                    count,
                })
            }
        }
        Ok(())
    }

    /// Toggle a label on the entity owning the given adapter identities.
    pub fn add_label_to_entity(
        &self,
        entity_type: EntityType,
        identity_by_adapter: &[AdapterIdentity],
        label: &str,
        enabled: bool,
        issuer: &PluginIdentity,
    ) -> TagResult<MergedEntity> {
        self.tag(
            entity_type,
            identity_by_adapter,
            label,
            Value::Bool(enabled),
            TagType::Label,
            TagAction::Replace,
            None,
            issuer,
        )
    }

    /// Attach an arbitrary data tag.
    pub fn add_data_to_entity(
        &self,
        entity_type: EntityType,
        identity_by_adapter: &[AdapterIdentity],
        name: &str,
        data: Value,
        action_if_exists: TagAction,
        issuer: &PluginIdentity,
    ) -> TagResult<MergedEntity> {
        self.tag(
            entity_type,
            identity_by_adapter,
            name,
            data,
            TagType::Data,
            action_if_exists,
            None,
            issuer,
        )
    }

    /// Attach adapter-substantiated data to the entity.
    pub fn add_adapterdata_to_entity(
        &self,
        entity_type: EntityType,
        identity_by_adapter: &[AdapterIdentity],
        name: &str,
        data: Value,
        action_if_exists: TagAction,
        client_used: Option<String>,
        issuer: &PluginIdentity,
    ) -> TagResult<MergedEntity> {
        self.tag(
            entity_type,
            identity_by_adapter,
            name,
            data,
            TagType::AdapterData,
            action_if_exists,
            client_used,
            issuer,
        )
    }
}
