//! Identity key derivation
//!
//! Two keys identify everything in the correlation engine:
//!
//! - `QuickId`: the lookup key for one adapter entity, derived from
//!   `(plugin_unique_name, native_id)`. Stored as a single hashed scalar so
//!   it can serve as a unique index without a compound multi-key index over
//!   the embedded adapter array.
//! - `InternalAxonId`: the canonical identifier of a merged entity, derived
//!   from the identity of its preferred member adapter entity. Stable across
//!   restarts; never regenerated for the same member identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hashed lookup key for a single adapter entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuickId(String);

impl QuickId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuickId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical identifier of a merged entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalAxonId(String);

impl InternalAxonId {
    /// Wrap an ID that was previously derived and persisted.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InternalAxonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one adapter entity as seen by its source adapter:
/// `(plugin_unique_name, native_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterIdentity {
    pub plugin_unique_name: String,
    pub native_id: String,
}

impl AdapterIdentity {
    pub fn new(plugin_unique_name: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            plugin_unique_name: plugin_unique_name.into(),
            native_id: native_id.into(),
        }
    }

    pub fn quick_id(&self) -> QuickId {
        quick_id(&self.plugin_unique_name, &self.native_id)
    }
}

impl std::fmt::Display for AdapterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.plugin_unique_name, self.native_id)
    }
}

fn hash_identity(domain: &str, plugin_unique_name: &str, native_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"!");
    hasher.update(plugin_unique_name.as_bytes());
    hasher.update(b"!");
    hasher.update(native_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the quick id for an adapter identity. Pure and deterministic.
pub fn quick_id(plugin_unique_name: &str, native_id: &str) -> QuickId {
    QuickId(hash_identity("quick", plugin_unique_name, native_id))
}

/// Derive the canonical merged-entity ID preferred for the given adapter
/// identity. Distinct hash domain from [`quick_id`] so the two key spaces
/// never collide.
pub fn internal_axon_id_for(plugin_unique_name: &str, native_id: &str) -> InternalAxonId {
    InternalAxonId(hash_identity("axon", plugin_unique_name, native_id))
}
