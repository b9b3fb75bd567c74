//! Snapshot manifest schema and restore plans.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Opaque snapshot identity: monotonic sequence plus a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn new(seq: u64, suffix: u16) -> Self {
        SnapshotId(format!("{seq:08}-{suffix:04x}"))
    }

    /// Sequence component, if the id has the expected shape.
    pub fn seq(&self) -> Option<u64> {
        self.0.split('-').next()?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// Captured by the daemon ahead of a pending change.
    Auto,
    /// Requested by the operator. Never auto-evicted by retention.
    Manual,
}

/// One captured file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// SHA-256 of the uncompressed content, hex.
    pub digest: String,
    /// Blob filename under `blobs/`; equals the digest hex.
    pub blob: String,
}

/// `manifest.json`, written last so its presence marks the snapshot complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub id: SnapshotId,
    pub created_at_wall_ms: u64,
    pub created_at_mono_ms: u64,
    pub origin: SnapshotOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entries: Vec<SnapshotEntry>,
    /// Id of the whole-system snapshot the system tool produced alongside,
    /// recorded for operator awareness only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_snapshot: Option<String>,
}

/// Listing row for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub created_at_wall_ms: u64,
    pub origin: SnapshotOrigin,
    pub description: Option<String>,
    pub entry_count: usize,
    pub tombstone_count: usize,
    pub system_snapshot: Option<String>,
}

/// One step of a restore plan. Steps execute in order: file writes first,
/// tombstone deletions after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RestoreStep {
    Write {
        path: PathBuf,
        digest: String,
        mode: u32,
        uid: u32,
        gid: u32,
    },
    /// The path did not exist at capture time; remove it.
    Remove { path: PathBuf },
}

impl RestoreStep {
    pub fn path(&self) -> &PathBuf {
        match self {
            RestoreStep::Write { path, .. } | RestoreStep::Remove { path } => path,
        }
    }
}

/// Ordered set of file writes, attribute fixups, and tombstone deletions.
///
/// Produced by the store, executed by the revert engine. Execution is
/// idempotent: writes are by content, removes tolerate absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePlan {
    pub snapshot_id: SnapshotId,
    pub steps: Vec<RestoreStep>,
}

impl RestorePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_format_and_seq() {
        let id = SnapshotId::new(42, 0xbeef);
        assert_eq!(id.as_str(), "00000042-beef");
        assert_eq!(id.seq(), Some(42));
    }

    #[test]
    fn manifest_roundtrip() {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            id: SnapshotId::new(1, 1),
            created_at_wall_ms: 1_700_000_000_000,
            created_at_mono_ms: 12,
            origin: SnapshotOrigin::Auto,
            description: None,
            entries: vec![SnapshotEntry {
                path: PathBuf::from("/etc/ssh/sshd_config"),
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 10,
                digest: "ab".repeat(32),
                blob: "ab".repeat(32),
            }],
            system_snapshot: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, manifest.id);
        assert_eq!(parsed.entries, manifest.entries);
        // Optional fields stay out of the document entirely.
        assert!(!json.contains("description"));
        assert!(!json.contains("system_snapshot"));
    }
}
