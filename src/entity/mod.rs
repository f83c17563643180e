//! Entity data model: adapter entities, merged entities, tags, identity keys.
//!
//! An `AdapterEntity` is one record as discovered by a single adapter
//! connection. A `MergedEntity` is the deduplicated real-world device or
//! user built by correlating one or more adapter entities. The merged
//! entity exclusively owns its embedded adapter entities and tags; the only
//! external handle to a member is its quick id.

pub mod identity;
pub mod oldness;
pub mod tag;

pub use identity::{internal_axon_id_for, quick_id, AdapterIdentity, InternalAxonId, QuickId};
pub use oldness::recalculate_oldness;
pub use tag::{deep_merge_maps, value_is_truthy, Tag, TagAction, TagType, NOTES_TAG_NAME};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Name of the free-form data field holding an adapter's last-seen timestamp.
pub const LAST_SEEN_FIELD: &str = "last_seen";
/// Name of the free-form data field marking a superseded duplicate member.
pub const OLD_FIELD: &str = "_old";
/// Sentinel value of `data.correlates` marking a record that must not be
/// ingested at all (scanner adapters emit these for noise they recognized).
pub const IGNORE_RECORD: &str = "IGNORE";

/// The two parallel entity domains the engine operates over identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Devices,
    Users,
}

impl EntityType {
    /// Whether duplicate same-adapter members of this type carry a
    /// meaningful `_old` flag.
    pub fn is_old_calculated(&self) -> bool {
        matches!(self, EntityType::Devices)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Devices => "devices",
            EntityType::Users => "users",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The 3-part identity of a plugin producing adapter entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub plugin_type: String,
    pub plugin_name: String,
    pub plugin_unique_name: String,
}

impl PluginIdentity {
    pub fn new(
        plugin_type: impl Into<String>,
        plugin_name: impl Into<String>,
        plugin_unique_name: impl Into<String>,
    ) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            plugin_name: plugin_name.into(),
            plugin_unique_name: plugin_unique_name.into(),
        }
    }
}

/// Where a first-seen adapter entity attaches: its own new merged entity,
/// or (for scanner adapters that recognized another adapter's device)
/// appended to the merged entity already holding the correlated target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEntityOrigin {
    FirstSeen,
    CorrelatesWith(AdapterIdentity),
}

/// One discovered record from exactly one adapter connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEntity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_used: Option<String>,
    pub plugin_type: String,
    pub plugin_name: String,
    pub plugin_unique_name: String,
    /// Hashed `(plugin_unique_name, data.id)`; the unique lookup key for
    /// this member across the whole corpus.
    pub quick_id: QuickId,
    pub accurate_for_datetime: DateTime<Utc>,
    /// Free-form adapter-defined fields. Always contains `id`; may contain
    /// `last_seen`, `pretty_id`, `fetch_time`, `first_fetch_time`, `_old`.
    pub data: Map<String, Value>,
}

impl AdapterEntity {
    /// Build a member from parsed adapter data. The caller is responsible
    /// for having popped the `raw` payload to the side store already.
    pub fn new(
        client_used: Option<String>,
        plugin: &PluginIdentity,
        mut data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let native_id = data
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        data.insert(
            "accurate_for_datetime".to_string(),
            Value::String(now.to_rfc3339()),
        );
        Self {
            client_used,
            plugin_type: plugin.plugin_type.clone(),
            plugin_name: plugin.plugin_name.clone(),
            plugin_unique_name: plugin.plugin_unique_name.clone(),
            quick_id: quick_id(&plugin.plugin_unique_name, &native_id),
            accurate_for_datetime: now,
            data,
        }
    }

    /// The adapter-native id of this record.
    pub fn native_id(&self) -> &str {
        self.data.get("id").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn identity(&self) -> AdapterIdentity {
        AdapterIdentity::new(self.plugin_unique_name.clone(), self.native_id())
    }

    /// The canonical merged-entity ID this member would prefer.
    pub fn preferred_internal_axon_id(&self) -> InternalAxonId {
        internal_axon_id_for(&self.plugin_unique_name, self.native_id())
    }

    /// Parsed `last_seen`, when present and parseable.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        parse_datetime(self.data.get(LAST_SEEN_FIELD)?)
    }
}

/// Parse a free-form data timestamp (RFC 3339 string).
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// The deduplicated real-world device or user: the unit the rest of the
/// system treats as one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedEntity {
    pub internal_axon_id: InternalAxonId,
    pub accurate_for_datetime: DateTime<Utc>,
    pub adapters: Vec<AdapterEntity>,
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Cached count of distinct `plugin_name`s among members. Must be kept
    /// consistent with `adapters` on every mutation.
    pub adapter_list_length: usize,
    /// True iff some tag named the reserved notes tag carries truthy data.
    #[serde(default)]
    pub has_notes: bool,
    /// Audit trail of merge justifications.
    #[serde(default)]
    pub correlation_reasons: Vec<String>,
}

impl MergedEntity {
    /// Create a brand-new merged entity around a single first-seen member.
    pub fn for_single(adapter: AdapterEntity) -> Self {
        let internal_axon_id = adapter.preferred_internal_axon_id();
        Self {
            internal_axon_id,
            accurate_for_datetime: Utc::now(),
            adapters: vec![adapter],
            tags: Vec::new(),
            labels: BTreeSet::new(),
            adapter_list_length: 1,
            has_notes: false,
            correlation_reasons: Vec::new(),
        }
    }

    /// Distinct `plugin_name` count over the current members.
    pub fn distinct_plugin_names(&self) -> usize {
        self.adapters
            .iter()
            .map(|a| a.plugin_name.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Re-derive the cached `adapter_list_length`.
    pub fn refresh_adapter_list_length(&mut self) {
        self.adapter_list_length = self.distinct_plugin_names();
    }

    /// Re-derive `has_notes` from the current tags.
    pub fn refresh_has_notes(&mut self) {
        self.has_notes = self.tags.iter().any(Tag::is_truthy_notes);
    }

    /// Find a member by its adapter identity.
    pub fn member(&self, identity: &AdapterIdentity) -> Option<&AdapterEntity> {
        self.adapters.iter().find(|a| {
            a.plugin_unique_name == identity.plugin_unique_name
                && a.native_id() == identity.native_id
        })
    }

    /// Position of a member by its adapter identity.
    pub fn member_index(&self, identity: &AdapterIdentity) -> Option<usize> {
        self.adapters.iter().position(|a| {
            a.plugin_unique_name == identity.plugin_unique_name
                && a.native_id() == identity.native_id
        })
    }

    /// All member identities.
    pub fn member_identities(&self) -> Vec<AdapterIdentity> {
        self.adapters.iter().map(AdapterEntity::identity).collect()
    }
}
