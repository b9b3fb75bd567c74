//! Snapshot store.
//!
//! Content-addressed-by-path-and-time archive of prior file states. Each
//! snapshot lives in its own directory:
//!
//! ```text
//! <location>/<snapshot_id>/
//!   manifest.json     written last, temp + rename; presence = complete
//!   tombstones.json   paths that did not exist at capture
//!   blobs/<digest>    gzip-compressed payload, filename = content digest
//! ```
//!
//! The store is the sole owner of payload-blob I/O; other components hold
//! snapshot ids and ask for plans or payloads.

mod manifest;

pub use manifest::{
    Manifest, RestorePlan, RestoreStep, SnapshotEntry, SnapshotId, SnapshotMeta, SnapshotOrigin,
    MANIFEST_VERSION,
};

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Transience;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("snapshot not found: {0}")]
    NotFound(SnapshotId),

    #[error("snapshot {id} is corrupt: {entries:?}")]
    Corrupt {
        id: SnapshotId,
        entries: Vec<PathBuf>,
    },

    #[error("manifest error for {id}: {reason}")]
    Manifest { id: SnapshotId, reason: String },

    #[error("snapshot capture failed: {0}")]
    CaptureFailed(String),
}

impl SnapshotError {
    pub fn transience(&self) -> Transience {
        match self {
            SnapshotError::Io { .. } | SnapshotError::CaptureFailed(_) => Transience::Retryable,
            SnapshotError::NotFound(_)
            | SnapshotError::Corrupt { .. }
            | SnapshotError::Manifest { .. } => Transience::Permanent,
        }
    }
}

/// Outcome of an integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    /// Paths whose payload is missing or whose digest no longer matches.
    Corrupt(Vec<PathBuf>),
}

pub struct SnapshotStore {
    location: PathBuf,
    /// Highest sequence seen, so ids stay monotonic across restarts.
    next_seq: u64,
    /// Shell out to the system snapshot tool alongside file captures.
    system_tool: bool,
    epoch: Instant,
}

impl SnapshotStore {
    /// Open (creating if needed) the store at `location` and sweep orphaned
    /// capture directories left behind by a crash before manifest rename.
    pub fn open(location: &Path, system_tool: bool) -> Result<Self, SnapshotError> {
        fs::create_dir_all(location).map_err(|e| SnapshotError::Io {
            path: location.to_path_buf(),
            source: e,
        })?;

        let mut store = Self {
            location: location.to_path_buf(),
            next_seq: 1,
            system_tool,
            epoch: Instant::now(),
        };
        store.sweep_orphans()?;
        store.next_seq = store
            .list()?
            .iter()
            .filter_map(|m| m.id.seq())
            .max()
            .map_or(1, |max| max + 1);
        Ok(store)
    }

    /// Capture the current bytes of `paths`.
    ///
    /// Paths that do not currently exist become tombstone entries. The
    /// manifest is written last via temp-write-and-rename, so a crash leaves
    /// an orphan directory for the startup sweeper rather than a half
    /// snapshot that looks complete.
    pub fn snapshot_paths(
        &mut self,
        paths: &[PathBuf],
        origin: SnapshotOrigin,
        description: Option<String>,
    ) -> Result<SnapshotId, SnapshotError> {
        let id = SnapshotId::new(self.next_seq, rand::thread_rng().gen());
        let dir = self.location.join(id.as_str());
        let blobs = dir.join("blobs");
        fs::create_dir_all(&blobs).map_err(|e| SnapshotError::Io {
            path: blobs.clone(),
            source: e,
        })?;

        let mut entries = Vec::new();
        let mut tombstones: Vec<PathBuf> = Vec::new();

        for path in paths {
            let metadata = match fs::symlink_metadata(path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    debug!(path = %path.display(), "skipping non-regular file");
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tombstones.push(path.clone());
                    continue;
                }
                Err(e) => {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(SnapshotError::Io {
                        path: path.clone(),
                        source: e,
                    });
                }
            };

            let bytes = fs::read(path).map_err(|e| SnapshotError::Io {
                path: path.clone(),
                source: e,
            })?;
            let digest = hex::encode(Sha256::digest(&bytes));

            let blob_path = blobs.join(&digest);
            if !blob_path.exists() {
                write_blob(&blob_path, &bytes)?;
            }

            entries.push(SnapshotEntry {
                path: path.clone(),
                mode: metadata.mode() & 0o7777,
                uid: metadata.uid(),
                gid: metadata.gid(),
                size: metadata.len(),
                digest: digest.clone(),
                blob: digest,
            });
        }

        write_json_atomic(&dir.join("tombstones.json"), &tombstones)?;

        let system_snapshot = if self.system_tool {
            self.request_system_snapshot(description.as_deref())
        } else {
            None
        };

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            id: id.clone(),
            created_at_wall_ms: crate::wall_ms(),
            created_at_mono_ms: self.epoch.elapsed().as_millis() as u64,
            origin,
            description,
            entries,
            system_snapshot,
        };
        write_json_atomic(&dir.join("manifest.json"), &manifest)?;

        self.next_seq += 1;
        info!(
            snapshot = %id,
            files = manifest.entries.len(),
            tombstones = tombstones.len(),
            "snapshot captured"
        );
        Ok(id)
    }

    /// Snapshot metadata, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>, SnapshotError> {
        let mut metas = Vec::new();
        let read_dir = fs::read_dir(&self.location).map_err(|e| SnapshotError::Io {
            path: self.location.clone(),
            source: e,
        })?;
        for entry in read_dir.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            match self.load_manifest_dir(&entry.path()) {
                Ok(Some((manifest, tombstones))) => metas.push(SnapshotMeta {
                    id: manifest.id,
                    created_at_wall_ms: manifest.created_at_wall_ms,
                    origin: manifest.origin,
                    description: manifest.description,
                    entry_count: manifest.entries.len(),
                    tombstone_count: tombstones.len(),
                    system_snapshot: manifest.system_snapshot,
                }),
                Ok(None) => {}
                Err(e) => warn!(dir = %entry.path().display(), "unreadable snapshot: {e}"),
            }
        }
        metas.sort_by(|a, b| b.created_at_wall_ms.cmp(&a.created_at_wall_ms).then(b.id.cmp(&a.id)));
        Ok(metas)
    }

    /// Produce the ordered plan that would restore `id`.
    ///
    /// `paths` scopes the plan to a subset of the snapshot; `None` restores
    /// everything. The plan is returned, never executed here.
    pub fn restore(
        &self,
        id: &SnapshotId,
        paths: Option<&[PathBuf]>,
    ) -> Result<RestorePlan, SnapshotError> {
        let (manifest, tombstones) = self.load_snapshot(id)?;
        let wanted = |p: &PathBuf| paths.map_or(true, |set| set.contains(p));

        let mut steps = Vec::new();
        for entry in &manifest.entries {
            if wanted(&entry.path) {
                steps.push(RestoreStep::Write {
                    path: entry.path.clone(),
                    digest: entry.digest.clone(),
                    mode: entry.mode,
                    uid: entry.uid,
                    gid: entry.gid,
                });
            }
        }
        for path in &tombstones {
            if wanted(path) {
                steps.push(RestoreStep::Remove { path: path.clone() });
            }
        }
        // Requested paths the snapshot knows nothing about did not exist at
        // capture either (they appeared after): remove them too.
        if let Some(requested) = paths {
            for path in requested {
                if !manifest.entries.iter().any(|e| &e.path == path)
                    && !tombstones.contains(path)
                {
                    steps.push(RestoreStep::Remove { path: path.clone() });
                }
            }
        }
        Ok(RestorePlan {
            snapshot_id: id.clone(),
            steps,
        })
    }

    /// Decompress and digest-check one payload.
    pub fn read_payload(&self, id: &SnapshotId, digest: &str) -> Result<Vec<u8>, SnapshotError> {
        let blob_path = self.location.join(id.as_str()).join("blobs").join(digest);
        let compressed = fs::read(&blob_path).map_err(|e| SnapshotError::Io {
            path: blob_path.clone(),
            source: e,
        })?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes).map_err(|e| SnapshotError::Io {
            path: blob_path,
            source: e,
        })?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != digest {
            return Err(SnapshotError::Corrupt {
                id: id.clone(),
                entries: vec![PathBuf::from(digest)],
            });
        }
        Ok(bytes)
    }

    /// Recompute every entry digest against its payload.
    pub fn verify(&self, id: &SnapshotId) -> Result<VerifyOutcome, SnapshotError> {
        let (manifest, _) = self.load_snapshot(id)?;
        let mut corrupt = Vec::new();
        for entry in &manifest.entries {
            match self.read_payload(id, &entry.digest) {
                Ok(_) => {}
                Err(_) => corrupt.push(entry.path.clone()),
            }
        }
        if corrupt.is_empty() {
            Ok(VerifyOutcome::Ok)
        } else {
            Ok(VerifyOutcome::Corrupt(corrupt))
        }
    }

    /// Evict old `auto` snapshots beyond the count or age limits.
    ///
    /// `manual` snapshots are never auto-evicted.
    pub fn retain(&mut self, max_snapshots: usize, max_age_days: u64) -> Result<usize, SnapshotError> {
        let now = crate::wall_ms();
        let max_age_ms = max_age_days.saturating_mul(24 * 60 * 60 * 1000);
        let autos: Vec<SnapshotMeta> = self
            .list()?
            .into_iter()
            .filter(|m| m.origin == SnapshotOrigin::Auto)
            .collect();

        let mut evicted = 0;
        for (index, meta) in autos.iter().enumerate() {
            let too_many = index >= max_snapshots;
            let too_old = now.saturating_sub(meta.created_at_wall_ms) > max_age_ms;
            if too_many || too_old {
                self.delete(&meta.id)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "retention evicted old snapshots");
        }
        Ok(evicted)
    }

    /// Manifest plus tombstone list for one snapshot.
    pub fn manifest(&self, id: &SnapshotId) -> Result<(Manifest, Vec<PathBuf>), SnapshotError> {
        self.load_snapshot(id)
    }

    /// Remove one snapshot directory.
    pub fn delete(&mut self, id: &SnapshotId) -> Result<(), SnapshotError> {
        let dir = self.location.join(id.as_str());
        if !dir.exists() {
            return Err(SnapshotError::NotFound(id.clone()));
        }
        fs::remove_dir_all(&dir).map_err(|e| SnapshotError::Io { path: dir, source: e })?;
        debug!(snapshot = %id, "snapshot deleted");
        Ok(())
    }

    /// Remove capture directories that never got a manifest.
    fn sweep_orphans(&self) -> Result<(), SnapshotError> {
        let read_dir = fs::read_dir(&self.location).map_err(|e| SnapshotError::Io {
            path: self.location.clone(),
            source: e,
        })?;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.is_dir() && !path.join("manifest.json").exists() {
                warn!(dir = %path.display(), "sweeping incomplete snapshot");
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(())
    }

    fn load_snapshot(&self, id: &SnapshotId) -> Result<(Manifest, Vec<PathBuf>), SnapshotError> {
        let dir = self.location.join(id.as_str());
        match self.load_manifest_dir(&dir)? {
            Some(loaded) => Ok(loaded),
            None => Err(SnapshotError::NotFound(id.clone())),
        }
    }

    fn load_manifest_dir(
        &self,
        dir: &Path,
    ) -> Result<Option<(Manifest, Vec<PathBuf>)>, SnapshotError> {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&manifest_path).map_err(|e| SnapshotError::Io {
            path: manifest_path.clone(),
            source: e,
        })?;
        let manifest: Manifest = serde_json::from_str(&contents).map_err(|e| {
            SnapshotError::Manifest {
                id: SnapshotId(dir.file_name().unwrap_or_default().to_string_lossy().into()),
                reason: e.to_string(),
            }
        })?;
        let tombstones = match fs::read_to_string(dir.join("tombstones.json")) {
            Ok(t) => serde_json::from_str(&t).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Ok(Some((manifest, tombstones)))
    }

    /// Ask the system snapshot tool for a whole-system snapshot.
    ///
    /// Best effort: the file-level snapshot is the source of truth, so a
    /// failing or absent tool only logs.
    fn request_system_snapshot(&self, description: Option<&str>) -> Option<String> {
        let comment = description.unwrap_or("revertit pre-change snapshot");
        let output = Command::new("timeshift")
            .args(["--create", "--comments", comment, "--tags", "D"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let parsed = parse_system_snapshot_id(&stdout);
                if parsed.is_none() {
                    warn!("system snapshot created but id not found in tool output");
                }
                parsed
            }
            Ok(out) => {
                warn!(status = ?out.status.code(), "system snapshot tool failed");
                None
            }
            Err(e) => {
                debug!("system snapshot tool unavailable: {e}");
                None
            }
        }
    }
}

/// Pull the snapshot name out of the tool's human-oriented output.
fn parse_system_snapshot_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if line.contains("Snapshot saved successfully") || line.contains("created in") {
            for token in line.split_whitespace() {
                if token.starts_with("20") && token.contains('_') {
                    return Some(token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-').to_string());
                }
            }
        }
    }
    None
}

fn write_blob(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let compressed = encoder.finish().map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(path, compressed).map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let dir = path.parent().ok_or_else(|| SnapshotError::Manifest {
        id: SnapshotId("?".into()),
        reason: "manifest path has no parent".into(),
    })?;
    let json = serde_json::to_vec_pretty(value).map_err(|e| SnapshotError::Manifest {
        id: SnapshotId("?".into()),
        reason: e.to_string(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(temp.path(), &json).map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    temp.as_file().sync_all().map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    temp.persist(path).map_err(|e| SnapshotError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::open(&dir.path().join("store"), false).unwrap()
    }

    #[test]
    fn capture_and_payload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("sshd_config");
        fs::write(&file, b"Port 22\n").unwrap();

        let mut store = store(&dir);
        let id = store
            .snapshot_paths(&[file.clone()], SnapshotOrigin::Auto, None)
            .unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].entry_count, 1);
        assert_eq!(metas[0].tombstone_count, 0);

        let plan = store.restore(&id, None).unwrap();
        assert_eq!(plan.steps.len(), 1);
        let RestoreStep::Write { digest, .. } = &plan.steps[0] else {
            panic!("expected write step");
        };
        assert_eq!(store.read_payload(&id, digest).unwrap(), b"Port 22\n");
    }

    #[test]
    fn missing_path_becomes_tombstone() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let ghost = dir.path().join("nonexistent.conf");
        let id = store
            .snapshot_paths(&[ghost.clone()], SnapshotOrigin::Auto, None)
            .unwrap();

        let plan = store.restore(&id, None).unwrap();
        assert_eq!(plan.steps, vec![RestoreStep::Remove { path: ghost }]);
    }

    #[test]
    fn verify_detects_blob_tampering() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("rules.v4");
        fs::write(&file, b"-A INPUT -j ACCEPT\n").unwrap();

        let mut store = store(&dir);
        let id = store
            .snapshot_paths(&[file.clone()], SnapshotOrigin::Auto, None)
            .unwrap();
        assert_eq!(store.verify(&id).unwrap(), VerifyOutcome::Ok);

        // Disturb the blob.
        let blobs = dir.path().join("store").join(id.as_str()).join("blobs");
        let blob = fs::read_dir(&blobs).unwrap().next().unwrap().unwrap().path();
        fs::write(&blob, b"garbage").unwrap();

        match store.verify(&id).unwrap() {
            VerifyOutcome::Corrupt(paths) => assert_eq!(paths, vec![file]),
            VerifyOutcome::Ok => panic!("tampering went undetected"),
        }
    }

    #[test]
    fn orphan_without_manifest_is_swept_on_open() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let orphan = root.join("00000009-dead");
        fs::create_dir_all(orphan.join("blobs")).unwrap();
        fs::write(orphan.join("blobs").join("aa"), b"x").unwrap();

        let store = SnapshotStore::open(&root, false).unwrap();
        assert!(!orphan.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn ids_stay_monotonic_across_reopen() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let file = dir.path().join("f");
        fs::write(&file, b"1").unwrap();

        let first = {
            let mut store = SnapshotStore::open(&root, false).unwrap();
            store
                .snapshot_paths(&[file.clone()], SnapshotOrigin::Auto, None)
                .unwrap()
        };
        let second = {
            let mut store = SnapshotStore::open(&root, false).unwrap();
            store
                .snapshot_paths(&[file], SnapshotOrigin::Auto, None)
                .unwrap()
        };
        assert!(second.seq().unwrap() > first.seq().unwrap());
    }

    #[test]
    fn retention_never_evicts_manual_snapshots() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        let mut store = store(&dir);

        // 5 automatic and 1 manual, interleaved.
        let mut autos = Vec::new();
        for i in 0..5 {
            fs::write(&file, format!("rev {i}")).unwrap();
            autos.push(
                store
                    .snapshot_paths(&[file.clone()], SnapshotOrigin::Auto, None)
                    .unwrap(),
            );
            if i == 2 {
                fs::write(&file, "manual rev").unwrap();
                store
                    .snapshot_paths(
                        &[file.clone()],
                        SnapshotOrigin::Manual,
                        Some("keep me".into()),
                    )
                    .unwrap();
            }
        }

        let evicted = store.retain(3, 365).unwrap();
        assert_eq!(evicted, 2);

        let remaining = store.list().unwrap();
        let auto_left: Vec<_> = remaining
            .iter()
            .filter(|m| m.origin == SnapshotOrigin::Auto)
            .map(|m| m.id.clone())
            .collect();
        let manual_left = remaining
            .iter()
            .filter(|m| m.origin == SnapshotOrigin::Manual)
            .count();

        assert_eq!(manual_left, 1);
        assert_eq!(auto_left.len(), 3);
        // The three newest automatic snapshots survive.
        let mut expected = autos[2..].to_vec();
        expected.reverse();
        assert_eq!(auto_left, expected);
    }

    #[test]
    fn blobs_dedup_identical_content_within_snapshot() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.conf");
        let b = dir.path().join("b.conf");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let mut store = store(&dir);
        let id = store
            .snapshot_paths(&[a, b], SnapshotOrigin::Auto, None)
            .unwrap();

        let blobs = dir.path().join("store").join(id.as_str()).join("blobs");
        assert_eq!(fs::read_dir(&blobs).unwrap().count(), 1);
        let metas = store.list().unwrap();
        assert_eq!(metas[0].entry_count, 2);
    }

    #[test]
    fn paths_unknown_to_the_snapshot_become_removals() {
        let dir = TempDir::new().unwrap();
        let known = dir.path().join("known.conf");
        fs::write(&known, b"known").unwrap();

        let mut store = store(&dir);
        let id = store
            .snapshot_paths(&[known.clone()], SnapshotOrigin::Auto, None)
            .unwrap();

        // A file that appeared after capture is planned away.
        let newcomer = dir.path().join("newcomer.conf");
        let plan = store
            .restore(&id, Some(&[known.clone(), newcomer.clone()]))
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan
            .steps
            .contains(&RestoreStep::Remove { path: newcomer }));
    }

    #[test]
    fn restore_scoped_to_requested_paths() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.conf");
        let b = dir.path().join("b.conf");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut store = store(&dir);
        let id = store
            .snapshot_paths(&[a.clone(), b], SnapshotOrigin::Auto, None)
            .unwrap();

        let plan = store.restore(&id, Some(&[a.clone()])).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].path(), &a);
    }
}
