//! Pending-change identity, state, and policy types.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::TimeoutAction;
use crate::host::Reachability;
use crate::snapshot::SnapshotId;

/// Opaque change identity of the form `<category>_<monotonic_seq>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub String);

impl ChangeId {
    pub fn new(category: &str, seq: u64) -> Self {
        ChangeId(format!("{category}_{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a pending change.
///
/// OPEN and GRACE are the live states; CONFIRMED, REVERTED, and FAILED are
/// terminal and reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeState {
    Open,
    Grace,
    Reverting,
    Confirmed,
    Reverted,
    Failed,
}

impl ChangeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChangeState::Confirmed | ChangeState::Reverted | ChangeState::Failed
        )
    }

    /// A confirm is honored in OPEN and GRACE only.
    pub fn is_confirmable(self) -> bool {
        matches!(self, ChangeState::Open | ChangeState::Grace)
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeState::Open => "OPEN",
            ChangeState::Grace => "GRACE",
            ChangeState::Reverting => "REVERTING",
            ChangeState::Confirmed => "CONFIRMED",
            ChangeState::Reverted => "REVERTED",
            ChangeState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Static per-category policy, assembled at startup from the configuration
/// and the detected host capabilities.
#[derive(Debug, Clone)]
pub struct CategoryPolicy {
    pub name: String,
    /// Confirmation window.
    pub timeout: Duration,
    /// Window after deadline expiry during which a late confirm still wins.
    pub grace: Duration,
    /// Probe reachability while the change sits in grace.
    pub connectivity_check: bool,
    /// Services restarted, in order, after a revert restores the files.
    pub restart_services: Vec<String>,
    pub timeout_action: TimeoutAction,
}

/// One in-flight confirmation window covering one or more edits to paths of
/// a single category.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub id: ChangeId,
    pub category: String,
    pub paths: BTreeSet<PathBuf>,
    /// Pre-change snapshot: the category's last accepted state.
    pub snapshot_id: SnapshotId,
    pub state: ChangeState,
    pub created_at_ms: u64,
    /// Monotonic deadline; fixed when the change opens, never extended.
    pub deadline: Instant,
    /// Wall-clock twin of `deadline`, for restart resume.
    pub deadline_wall_ms: u64,
    pub grace_deadline: Option<Instant>,
    pub grace_deadline_wall_ms: Option<u64>,
    /// Last observed event, for the coalescing window.
    pub last_event: Instant,
    /// Observed post-edit digests, applied to the baselines on confirm.
    pub observed_digests: Vec<(PathBuf, Option<String>)>,
    /// Most recent probe result, only meaningful while in GRACE.
    pub reachability: Option<Reachability>,
    /// When the change reached a terminal state, for the audit purge.
    pub terminal_at_ms: Option<u64>,
    /// Policy snapshot taken at open time.
    pub timeout_secs: u64,
    pub grace_secs: u64,
    pub connectivity_check: bool,
}

impl PendingChange {
    pub fn record_event(&mut self, path: PathBuf, digest: Option<String>, now: Instant) {
        self.paths.insert(path.clone());
        self.observed_digests.retain(|(p, _)| p != &path);
        self.observed_digests.push((path, digest));
        self.last_event = now;
    }

    /// Remaining confirmation window, zero once past the deadline.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// Wall-clock-only view of a change, used by the journal and the control
/// surface (monotonic instants do not serialize and do not survive restarts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub category: String,
    pub paths: BTreeSet<PathBuf>,
    pub snapshot_id: SnapshotId,
    pub state: ChangeState,
    pub created_at_ms: u64,
    pub deadline_wall_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_deadline_wall_ms: Option<u64>,
    #[serde(default)]
    pub observed_digests: Vec<(PathBuf, Option<String>)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at_ms: Option<u64>,
    pub timeout_secs: u64,
    pub grace_secs: u64,
    pub connectivity_check: bool,
}

impl ChangeRecord {
    pub fn from_change(change: &PendingChange) -> Self {
        ChangeRecord {
            id: change.id.clone(),
            category: change.category.clone(),
            paths: change.paths.clone(),
            snapshot_id: change.snapshot_id.clone(),
            state: change.state,
            created_at_ms: change.created_at_ms,
            deadline_wall_ms: change.deadline_wall_ms,
            grace_deadline_wall_ms: change.grace_deadline_wall_ms,
            observed_digests: change.observed_digests.clone(),
            terminal_at_ms: change.terminal_at_ms,
            timeout_secs: change.timeout_secs,
            grace_secs: change.grace_secs,
            connectivity_check: change.connectivity_check,
        }
    }

    /// Rebuild the in-memory change, mapping wall-clock deadlines back onto
    /// the monotonic clock. Remaining time is clamped to at least one second
    /// so a change never expires in the same instant the daemon resumes.
    pub fn into_change(self, now: Instant, now_wall_ms: u64) -> PendingChange {
        let remaining = Duration::from_millis(self.deadline_wall_ms.saturating_sub(now_wall_ms))
            .max(Duration::from_secs(1));
        let grace_deadline = self.grace_deadline_wall_ms.map(|wall| {
            now + Duration::from_millis(wall.saturating_sub(now_wall_ms)).max(Duration::from_secs(1))
        });
        PendingChange {
            id: self.id,
            category: self.category,
            paths: self.paths,
            snapshot_id: self.snapshot_id,
            state: self.state,
            created_at_ms: self.created_at_ms,
            deadline: now + remaining,
            deadline_wall_ms: self.deadline_wall_ms,
            grace_deadline,
            grace_deadline_wall_ms: self.grace_deadline_wall_ms,
            last_event: now,
            observed_digests: self.observed_digests,
            reachability: None,
            terminal_at_ms: self.terminal_at_ms,
            timeout_secs: self.timeout_secs,
            grace_secs: self.grace_secs,
            connectivity_check: self.connectivity_check,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_format() {
        assert_eq!(ChangeId::new("ssh", 1).as_str(), "ssh_1");
        assert_eq!(ChangeId::new("firewall", 17).as_str(), "firewall_17");
    }

    #[test]
    fn terminal_states() {
        assert!(!ChangeState::Open.is_terminal());
        assert!(!ChangeState::Grace.is_terminal());
        assert!(!ChangeState::Reverting.is_terminal());
        assert!(ChangeState::Confirmed.is_terminal());
        assert!(ChangeState::Reverted.is_terminal());
        assert!(ChangeState::Failed.is_terminal());
    }

    #[test]
    fn resume_clamps_expired_deadlines() {
        let record = ChangeRecord {
            id: ChangeId::new("ssh", 1),
            category: "ssh".into(),
            paths: BTreeSet::new(),
            snapshot_id: SnapshotId("00000001-0000".into()),
            state: ChangeState::Open,
            created_at_ms: 0,
            deadline_wall_ms: 10, // long past
            grace_deadline_wall_ms: None,
            observed_digests: vec![],
            terminal_at_ms: None,
            timeout_secs: 900,
            grace_secs: 30,
            connectivity_check: false,
        };
        let now = Instant::now();
        let change = record.into_change(now, 1_000_000);
        // Clamped to >= 1s in the future instead of firing immediately.
        assert!(change.deadline >= now + Duration::from_secs(1));
    }
}
