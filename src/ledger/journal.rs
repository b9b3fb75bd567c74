//! Ledger journal.
//!
//! Append-only JSON lines, one record per applied command, fsynced on every
//! append; compacted into a snapshot document at shutdown and when the log
//! crosses a size threshold. Replaying snapshot + log reconstructs the
//! change set, so OPEN and GRACE windows survive a daemon restart.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::change::{ChangeId, ChangeRecord};
use super::LedgerError;

/// Journal format version.
const JOURNAL_VERSION: u32 = 1;

/// Compact once the log grows past this many bytes.
const COMPACT_THRESHOLD: u64 = 1024 * 1024;

/// One applied ledger command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalRecord {
    Opened {
        change: ChangeRecord,
    },
    Merged {
        id: ChangeId,
        path: PathBuf,
        #[serde(default)]
        digest: Option<String>,
        at_ms: u64,
    },
    Confirmed {
        id: ChangeId,
        actor: String,
        at_ms: u64,
    },
    Cancelled {
        id: ChangeId,
        actor: String,
        at_ms: u64,
    },
    DeadlineFired {
        id: ChangeId,
        grace_deadline_wall_ms: u64,
        at_ms: u64,
    },
    GraceFired {
        id: ChangeId,
        at_ms: u64,
    },
    RevertFinished {
        id: ChangeId,
        success: bool,
        #[serde(default)]
        reason: Option<String>,
        at_ms: u64,
    },
    Purged {
        id: ChangeId,
        at_ms: u64,
    },
}

/// Compacted ledger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub next_seq: u64,
    pub changes: Vec<ChangeRecord>,
}

pub struct Journal {
    log_path: PathBuf,
    snapshot_path: PathBuf,
    log: Option<File>,
}

impl Journal {
    pub fn open(state_dir: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(state_dir).map_err(|e| LedgerError::Journal {
            path: state_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Journal {
            log_path: state_dir.join("ledger.log"),
            snapshot_path: state_dir.join("ledger.snapshot.json"),
            log: None,
        })
    }

    /// Load the compacted snapshot (if any) and the trailing log records.
    pub fn load(&self) -> Result<(Option<LedgerSnapshot>, Vec<JournalRecord>), LedgerError> {
        let snapshot = if self.snapshot_path.exists() {
            let contents =
                fs::read_to_string(&self.snapshot_path).map_err(|e| LedgerError::Journal {
                    path: self.snapshot_path.clone(),
                    reason: e.to_string(),
                })?;
            let snapshot: LedgerSnapshot =
                serde_json::from_str(&contents).map_err(|e| LedgerError::ReplayInconsistent {
                    reason: format!("snapshot unreadable: {e}"),
                })?;
            if snapshot.version != JOURNAL_VERSION {
                return Err(LedgerError::ReplayInconsistent {
                    reason: format!("snapshot version {} unsupported", snapshot.version),
                });
            }
            Some(snapshot)
        } else {
            None
        };

        let mut records = Vec::new();
        if self.log_path.exists() {
            let file = File::open(&self.log_path).map_err(|e| LedgerError::Journal {
                path: self.log_path.clone(),
                reason: e.to_string(),
            })?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| LedgerError::Journal {
                    path: self.log_path.clone(),
                    reason: e.to_string(),
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord =
                    serde_json::from_str(&line).map_err(|e| LedgerError::ReplayInconsistent {
                        reason: format!("log line {}: {e}", line_no + 1),
                    })?;
                records.push(record);
            }
        }
        debug!(records = records.len(), "journal loaded");
        Ok((snapshot, records))
    }

    /// Append one record, fsynced.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), LedgerError> {
        if self.log.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .map_err(|e| LedgerError::Journal {
                    path: self.log_path.clone(),
                    reason: e.to_string(),
                })?;
            self.log = Some(file);
        }
        let file = self.log.as_mut().expect("journal just opened");
        let mut line = serde_json::to_vec(record).map_err(|e| LedgerError::Journal {
            path: self.log_path.clone(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| LedgerError::Journal {
            path: self.log_path.clone(),
            reason: e.to_string(),
        })?;
        file.sync_data().map_err(|e| LedgerError::Journal {
            path: self.log_path.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Whether the log is large enough to be worth compacting.
    pub fn wants_compaction(&self) -> bool {
        fs::metadata(&self.log_path)
            .map(|m| m.len() >= COMPACT_THRESHOLD)
            .unwrap_or(false)
    }

    /// Replace snapshot + log with a fresh compacted snapshot.
    pub fn compact(&mut self, next_seq: u64, changes: Vec<ChangeRecord>) -> Result<(), LedgerError> {
        let snapshot = LedgerSnapshot {
            version: JOURNAL_VERSION,
            next_seq,
            changes,
        };
        let dir = self
            .snapshot_path
            .parent()
            .expect("snapshot path has a parent");
        let json =
            serde_json::to_vec_pretty(&snapshot).map_err(|e| LedgerError::Journal {
                path: self.snapshot_path.clone(),
                reason: e.to_string(),
            })?;
        let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| LedgerError::Journal {
            path: self.snapshot_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(temp.path(), &json).map_err(|e| LedgerError::Journal {
            path: self.snapshot_path.clone(),
            reason: e.to_string(),
        })?;
        temp.as_file().sync_all().map_err(|e| LedgerError::Journal {
            path: self.snapshot_path.clone(),
            reason: e.to_string(),
        })?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| LedgerError::Journal {
                path: self.snapshot_path.clone(),
                reason: e.error.to_string(),
            })?;

        // The snapshot now carries everything; start the log over.
        self.log = None;
        let _ = fs::remove_file(&self.log_path);
        info!(changes = snapshot.changes.len(), "ledger journal compacted");
        Ok(())
    }

    /// Drop all persisted state (`--force-reset`).
    pub fn reset(&mut self) -> Result<(), LedgerError> {
        self.log = None;
        let _ = fs::remove_file(&self.log_path);
        let _ = fs::remove_file(&self.snapshot_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChangeState;
    use crate::snapshot::SnapshotId;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn record(id: &str) -> ChangeRecord {
        ChangeRecord {
            id: ChangeId(id.to_string()),
            category: "ssh".into(),
            paths: BTreeSet::new(),
            snapshot_id: SnapshotId("00000001-0000".into()),
            state: ChangeState::Open,
            created_at_ms: 1,
            deadline_wall_ms: 1000,
            grace_deadline_wall_ms: None,
            observed_digests: vec![],
            terminal_at_ms: None,
            timeout_secs: 900,
            grace_secs: 30,
            connectivity_check: false,
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal
            .append(&JournalRecord::Opened { change: record("ssh_1") })
            .unwrap();
        journal
            .append(&JournalRecord::Confirmed {
                id: ChangeId("ssh_1".into()),
                actor: "root".into(),
                at_ms: 5,
            })
            .unwrap();

        let (snapshot, records) = Journal::open(dir.path()).unwrap().load().unwrap();
        assert!(snapshot.is_none());
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], JournalRecord::Opened { .. }));
        assert!(matches!(records[1], JournalRecord::Confirmed { .. }));
    }

    #[test]
    fn compact_clears_log_and_keeps_state() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal
            .append(&JournalRecord::Opened { change: record("ssh_1") })
            .unwrap();
        journal.compact(2, vec![record("ssh_1")]).unwrap();

        assert!(!dir.path().join("ledger.log").exists());
        let (snapshot, records) = Journal::open(dir.path()).unwrap().load().unwrap();
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.next_seq, 2);
        assert_eq!(snapshot.changes.len(), 1);
        assert!(records.is_empty());
    }

    #[test]
    fn garbage_log_line_is_replay_inconsistent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ledger.log"), "{not json}\n").unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        assert!(matches!(
            journal.load(),
            Err(LedgerError::ReplayInconsistent { .. })
        ));
    }

    #[test]
    fn reset_drops_everything() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal
            .append(&JournalRecord::Opened { change: record("ssh_1") })
            .unwrap();
        journal.compact(2, vec![]).unwrap();
        journal.reset().unwrap();
        let (snapshot, records) = journal.load().unwrap();
        assert!(snapshot.is_none());
        assert!(records.is_empty());
    }
}
