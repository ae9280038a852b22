use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stratum_core::{Observed, ResourceError, ResourceKind, ResourceStatus};

use crate::error::StorageError;

/// Current snapshot schema version. Bump when changing the shape and add a
/// step to [`migrate`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Last-observed state of every managed resource, read at the start of a
/// run and written once at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub updated_at: Option<jiff::Timestamp>,
    /// Resource id -> entry.
    #[serde(default)]
    pub resources: BTreeMap<String, SnapshotEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            serial: 0,
            updated_at: None,
            resources: BTreeMap::new(),
        }
    }
}

/// Persisted record for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    #[serde(default)]
    pub observed: Observed,
    /// Dependencies at the time of the last apply. Kept so resources that
    /// drop out of the graph can still be torn down dependents-first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ResourceError>,
    pub updated_at: jiff::Timestamp,
}

impl SnapshotEntry {
    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.resources.get(id)
    }

    pub fn upsert(&mut self, id: impl Into<String>, entry: SnapshotEntry) {
        self.resources.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<SnapshotEntry> {
        self.resources.remove(id)
    }

    /// Parse a snapshot from raw bytes, migrating older layouts first.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StorageError> {
        let json: serde_json::Value = serde_json::from_slice(bytes)?;
        let on_disk_version = json
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        let migrated = migrate(json, on_disk_version)?;
        Ok(serde_json::from_value(migrated)?)
    }
}

/// Run sequential migrations from `from_version` up to [`SNAPSHOT_VERSION`].
///
/// Each step is a pure transform on the raw JSON value.
fn migrate(
    mut json: serde_json::Value,
    from_version: u32,
) -> Result<serde_json::Value, StorageError> {
    if from_version > SNAPSHOT_VERSION {
        return Err(StorageError::VersionTooNew {
            found: from_version,
            supported: SNAPSHOT_VERSION,
        });
    }

    // v0 → v1: entries gain `dependencies`, the snapshot gains `serial`.
    if from_version < 1 {
        let obj = json
            .as_object_mut()
            .ok_or_else(|| StorageError::Malformed("snapshot is not a JSON object".into()))?;
        if let Some(resources) = obj.get_mut("resources").and_then(|r| r.as_object_mut()) {
            for entry in resources.values_mut() {
                if let Some(entry) = entry.as_object_mut() {
                    entry
                        .entry("dependencies")
                        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                }
            }
        }
        obj.entry("serial").or_insert(serde_json::Value::from(0));
        obj.insert("version".to_string(), serde_json::Value::from(1));
        tracing::info!("migrated state snapshot v0 → v1 (added dependencies)");
    }

    Ok(json)
}
