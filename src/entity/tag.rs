//! Tags: annotations attached to a merged entity, owned by an issuing plugin.
//!
//! A tag's identity on an entity is the triple `(name, plugin_unique_name,
//! type)`: at most one tag with a given identity may exist on a merged
//! entity at any time.

use super::identity::AdapterIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved tag name whose truthy data drives `MergedEntity::has_notes`.
pub const NOTES_TAG_NAME: &str = "Notes";

/// What kind of annotation a tag carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    /// Plain marker; label membership itself lives in the entity's label set.
    Label,
    /// Arbitrary data blob (notes and the like).
    Data,
    /// Data substantiated by a specific member adapter entity.
    #[serde(rename = "adapterdata")]
    AdapterData,
}

/// Conflict policy when a tag with the same identity triple already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagAction {
    /// Overwrite the existing tag in place (default).
    Replace,
    /// Deep-merge dicts into the prior data; arrays replace atomically.
    /// Only valid for adapterdata tags.
    Update,
    /// At link time, concatenate data arrays from every duplicate instead of
    /// keeping only the newest. Only valid for data tags.
    Merge,
}

impl Default for TagAction {
    fn default() -> Self {
        Self::Replace
    }
}

/// An annotation attached to a merged entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Constant "Tag"; kept for wire compatibility with the document layout.
    pub association_type: String,
    /// Which member adapter entities motivated this tag.
    pub associated_adapters: Vec<AdapterIdentity>,
    pub name: String,
    pub data: Value,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub action_if_exists: TagAction,
    /// Issuing plugin.
    pub plugin_unique_name: String,
    pub plugin_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_used: Option<String>,
    /// For adapterdata tags: the plugin_name of the member that substantiated
    /// the tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_adapter_plugin_name: Option<String>,
    pub accurate_for_datetime: DateTime<Utc>,
}

impl Tag {
    /// The identity triple under which tag uniqueness is enforced.
    pub fn identity(&self) -> (&str, &str, TagType) {
        (&self.name, &self.plugin_unique_name, self.tag_type)
    }

    /// Whether this tag carries note content (drives `has_notes`).
    pub fn is_truthy_notes(&self) -> bool {
        self.name == NOTES_TAG_NAME && value_is_truthy(&self.data)
    }
}

/// Python-style truthiness for free-form tag data.
pub fn value_is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Deep-merge `new` into `old`, dict-level only: object values merge
/// recursively, everything else (arrays included) is taken from `new`
/// wholesale. Fields are atomic replacement units.
pub fn deep_merge_maps(new: Value, old: Value) -> Value {
    match (new, old) {
        (Value::Object(new_map), Value::Object(old_map)) => {
            let mut merged = old_map;
            for (key, new_value) in new_map {
                let combined = match merged.remove(&key) {
                    Some(old_value) => deep_merge_maps(new_value, old_value),
                    None => new_value,
                };
                merged.insert(key, combined);
            }
            Value::Object(merged)
        }
        (new, _) => new,
    }
}
