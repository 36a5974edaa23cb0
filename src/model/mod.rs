//! Resource, Mirror, request options, and persisted-file value types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// One location from which a [`Resource`] can be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Mirror {
    /// Unique (within its resource) identifier for this mirror.
    pub id: String,
    /// The URI the download processor resolves to bytes.
    pub location: String,
    /// Dynamic metadata, including the optional `weight` selection hint.
    pub info: HashMap<String, Value>,
}

impl Mirror {
    /// Builds a mirror with empty metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            info: HashMap::new(),
        }
    }

    /// Sets the `weight` selection hint used by the default mirror policy.
    #[must_use]
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.info.insert("weight".to_string(), Value::from(weight));
        self
    }

    /// The selection weight, defaulting to `0` when absent or non-numeric.
    #[must_use]
    pub fn weight(&self) -> i64 {
        self.info.get("weight").and_then(Value::as_i64).unwrap_or(0)
    }
}

/// A logical file identity, backed by a main mirror and zero or more
/// alternatives.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Stable identifier used for deduplication and cache lookups.
    pub id: String,
    /// The mirror tried first by the default weighted policy, absent any
    /// weight override.
    pub main: Mirror,
    /// Fallback mirrors considered after `main` fails or loses the weighted
    /// draw.
    pub alternatives: Vec<Mirror>,
}

impl Resource {
    /// Builds a resource with no alternative mirrors.
    #[must_use]
    pub fn new(id: impl Into<String>, main: Mirror) -> Self {
        Self {
            id: id.into(),
            main,
            alternatives: Vec::new(),
        }
    }

    /// Attaches alternative mirrors.
    #[must_use]
    pub fn with_alternatives(mut self, alternatives: Vec<Mirror>) -> Self {
        self.alternatives = alternatives;
        self
    }

    /// All mirrors, main first, in declaration order.
    #[must_use]
    pub fn all_mirrors(&self) -> Vec<&Mirror> {
        std::iter::once(&self.main)
            .chain(self.alternatives.iter())
            .collect()
    }
}

/// Scheduling tier for a download admission. `Urgent` preempts queued
/// `High`/`Normal` work; see the Resource Manager's two-tier coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DownloadPriority {
    Normal,
    High,
    Urgent,
}

impl Default for DownloadPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl DownloadPriority {
    /// The heap-ordering weight used by [`crate::download::DownloadTask`].
    #[must_use]
    pub fn weight(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::High => 1,
            Self::Urgent => 2,
        }
    }
}

/// Storage durability class for a cached file. `Permanent` dominates
/// `Cached` and survives cache eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StoragePriority {
    #[default]
    Cached,
    Permanent,
}

impl StoragePriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Permanent => "permanent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "permanent" => Self::Permanent,
            _ => Self::Cached,
        }
    }
}

/// Caller-supplied options accompanying a [`crate::manager::ResourceManager::request`]
/// call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub download_priority: DownloadPriority,
    pub storage_priority: StoragePriority,
}

/// A persisted record of a resource's locally-cached file.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocalFile {
    pub resource_id: String,
    pub mirror_id: String,
    pub local_path: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "storage_priority")]
    storage_priority_raw: String,
}

impl LocalFile {
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        mirror_id: impl Into<String>,
        local_path: impl Into<String>,
        created_at: DateTime<Utc>,
        storage_priority: StoragePriority,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            mirror_id: mirror_id.into(),
            local_path: local_path.into(),
            created_at,
            storage_priority_raw: storage_priority.as_str().to_string(),
        }
    }

    #[must_use]
    pub fn storage_priority(&self) -> StoragePriority {
        StoragePriority::parse(&self.storage_priority_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_weight_defaults_to_zero() {
        let mirror = Mirror::new("m1", "https://example.com/a");
        assert_eq!(mirror.weight(), 0);
    }

    #[test]
    fn test_mirror_weight_override() {
        let mirror = Mirror::new("m1", "https://example.com/a").with_weight(7);
        assert_eq!(mirror.weight(), 7);
    }

    #[test]
    fn test_resource_all_mirrors_order() {
        let main = Mirror::new("main", "https://a");
        let alt1 = Mirror::new("alt1", "https://b");
        let resource = Resource::new("r1", main).with_alternatives(vec![alt1]);
        let ids: Vec<&str> = resource
            .all_mirrors()
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["main", "alt1"]);
    }

    #[test]
    fn test_priority_weight_ordering() {
        assert!(DownloadPriority::Urgent.weight() > DownloadPriority::High.weight());
        assert!(DownloadPriority::High.weight() > DownloadPriority::Normal.weight());
    }

    #[test]
    fn test_storage_priority_round_trip() {
        assert_eq!(StoragePriority::parse("permanent"), StoragePriority::Permanent);
        assert_eq!(StoragePriority::parse("cached"), StoragePriority::Cached);
        assert_eq!(StoragePriority::parse("garbage"), StoragePriority::Cached);
    }
}
