use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::change::{CategoryPolicy, ChangeId, ChangeRecord, ChangeState, PendingChange};
use super::journal::{Journal, JournalRecord};
use super::LedgerError;
use crate::config::TimeoutAction;
use crate::host::Reachability;
use crate::snapshot::SnapshotId;

/// Events of the same category arriving within this window of the covering
/// change's last event merge into it instead of opening a new change.
pub const COALESCE_WINDOW: Duration = Duration::from_secs(10);

/// How long terminal changes stay queryable before the purge.
const AUDIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Side effect the caller must carry out after a ledger command.
///
/// The ledger never talks to the timer, the worker, or the watcher itself;
/// it returns these and the state loop dispatches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ScheduleDeadline {
        id: ChangeId,
        due: Instant,
    },
    ScheduleGrace {
        id: ChangeId,
        due: Instant,
    },
    CancelTimers {
        id: ChangeId,
    },
    /// Probe reachability; result comes back via `probe_observed`.
    LaunchProbe {
        id: ChangeId,
        budget: Duration,
    },
    /// Execute a restore plan; result comes back via `revert_finished`.
    StartRevert {
        id: ChangeId,
        snapshot_id: SnapshotId,
        paths: Vec<PathBuf>,
        services: Vec<String>,
    },
    /// The category's accepted state moved; capture a fresh baseline
    /// snapshot. Completion comes back via `baseline_captured`.
    RefreshBaseline {
        category: String,
    },
}

pub struct Ledger {
    changes: BTreeMap<ChangeId, PendingChange>,
    policies: BTreeMap<String, CategoryPolicy>,
    /// Last-accepted content digest per watched path (`None` = absent).
    baselines: HashMap<PathBuf, Option<String>>,
    /// Last-accepted snapshot per category; the pre-change snapshot every
    /// new change in that category points at.
    category_snapshots: HashMap<String, SnapshotId>,
    next_seq: u64,
    journal: Journal,
    safe_mode: bool,
}

impl Ledger {
    /// Open the ledger, replaying the journal.
    ///
    /// Returns the resume effects for surviving changes: OPEN/GRACE windows
    /// are rescheduled with monotonic-delta-aware deadlines, and changes
    /// caught mid-revert re-enter the revert engine (plan execution is
    /// idempotent).
    pub fn open(
        state_dir: &Path,
        policies: BTreeMap<String, CategoryPolicy>,
        force_reset: bool,
        now: Instant,
    ) -> Result<(Self, Vec<Effect>), LedgerError> {
        let mut journal = Journal::open(state_dir)?;
        if force_reset {
            warn!("ledger journal reset requested, dropping persisted state");
            journal.reset()?;
        }

        let (snapshot, records) = journal.load()?;
        let mut folded: BTreeMap<ChangeId, ChangeRecord> = BTreeMap::new();
        let mut next_seq = 1;
        if let Some(snapshot) = snapshot {
            next_seq = snapshot.next_seq;
            for change in snapshot.changes {
                folded.insert(change.id.clone(), change);
            }
        }
        for record in records {
            apply_record(&mut folded, record)?;
        }
        for change in folded.values() {
            if let Some(seq) = change.id.as_str().rsplit('_').next().and_then(|s| s.parse::<u64>().ok()) {
                next_seq = next_seq.max(seq + 1);
            }
        }

        let now_wall = crate::wall_ms();
        let mut ledger = Ledger {
            changes: BTreeMap::new(),
            policies,
            baselines: HashMap::new(),
            category_snapshots: HashMap::new(),
            next_seq,
            journal,
            safe_mode: false,
        };

        let mut effects = Vec::new();
        for (_, record) in folded {
            // Terminal changes past the audit window do not survive replay.
            if let Some(terminal_at) = record.terminal_at_ms {
                if now_wall.saturating_sub(terminal_at) > AUDIT_WINDOW.as_millis() as u64 {
                    continue;
                }
            }
            let change = record.into_change(now, now_wall);
            match change.state {
                ChangeState::Open => effects.push(Effect::ScheduleDeadline {
                    id: change.id.clone(),
                    due: change.deadline,
                }),
                ChangeState::Grace => {
                    if let Some(due) = change.grace_deadline {
                        effects.push(Effect::ScheduleGrace {
                            id: change.id.clone(),
                            due,
                        });
                    }
                }
                ChangeState::Reverting => {
                    effects.push(ledger.revert_effect(&change));
                }
                _ => {}
            }
            // Resuming a change re-establishes its category baseline: the
            // pre-change snapshot is still the accepted state.
            if !change.state.is_terminal() {
                ledger
                    .category_snapshots
                    .entry(change.category.clone())
                    .or_insert_with(|| change.snapshot_id.clone());
            }
            ledger.changes.insert(change.id.clone(), change);
        }

        if !ledger.changes.is_empty() {
            info!(
                resumed = ledger.changes.len(),
                "ledger replayed from journal"
            );
        }
        Ok((ledger, effects))
    }

    // === Baselines ===

    /// Record a freshly captured accepted-state snapshot for `category`.
    pub fn baseline_captured(
        &mut self,
        category: &str,
        snapshot_id: SnapshotId,
        digests: Vec<(PathBuf, Option<String>)>,
    ) {
        debug!(category, snapshot = %snapshot_id, "baseline captured");
        self.category_snapshots
            .insert(category.to_string(), snapshot_id);
        for (path, digest) in digests {
            self.baselines.insert(path, digest);
        }
    }

    pub fn has_baseline(&self, category: &str) -> bool {
        self.category_snapshots.contains_key(category)
    }

    // === Commands ===
    //
    // Every mutating command journals first and only then touches the
    // in-memory change set: a record that never reached disk must not leave
    // state behind that a replay cannot reproduce.

    /// A debounced watcher event for a classified path.
    pub fn on_change_event(
        &mut self,
        category: &str,
        path: PathBuf,
        digest: Option<String>,
        now: Instant,
    ) -> Result<Vec<Effect>, LedgerError> {
        if self.safe_mode {
            warn!(path = %path.display(), "safe-mode: refusing to open changes");
            return Ok(Vec::new());
        }
        let Some(policy) = self.policies.get(category).cloned() else {
            debug!(category, "no policy for category, dropping event");
            return Ok(Vec::new());
        };

        // No-op write: content matches the accepted state. A path that was
        // never accepted and is already gone again (editor temp files) is
        // also a no-op.
        match (self.baselines.get(&path), &digest) {
            (Some(baseline), d) if baseline == d => {
                debug!(path = %path.display(), "digest matches baseline, dropping");
                return Ok(Vec::new());
            }
            (None, None) => {
                debug!(path = %path.display(), "untracked path already absent, dropping");
                return Ok(Vec::new());
            }
            _ => {}
        }

        // A path already covered by a live change merges into it regardless
        // of the window: one non-terminal change per path.
        if let Some(id) = self.covering_change(&path) {
            self.merge_event(&id, path, digest, now)?;
            return Ok(Vec::new());
        }

        // Coalesce into an open change of the same category within the
        // window. The deadline stays fixed: extending it would let chained
        // edits keep a change pending forever.
        if let Some(id) = self.coalescible_change(category, now) {
            self.merge_event(&id, path, digest, now)?;
            return Ok(Vec::new());
        }

        let Some(snapshot_id) = self.category_snapshots.get(category).cloned() else {
            // No accepted state to revert to; opening a change would promise
            // a restore the store cannot deliver.
            error!(
                category,
                path = %path.display(),
                "ALERT: no baseline snapshot, change not opened"
            );
            return Ok(Vec::new());
        };

        let id = ChangeId::new(category, self.next_seq);
        let now_wall = crate::wall_ms();
        let deadline = now + policy.timeout;
        let change = PendingChange {
            id: id.clone(),
            category: category.to_string(),
            paths: [path.clone()].into_iter().collect(),
            snapshot_id,
            state: ChangeState::Open,
            created_at_ms: now_wall,
            deadline,
            deadline_wall_ms: now_wall + policy.timeout.as_millis() as u64,
            grace_deadline: None,
            grace_deadline_wall_ms: None,
            last_event: now,
            observed_digests: vec![(path.clone(), digest)],
            reachability: None,
            terminal_at_ms: None,
            timeout_secs: policy.timeout.as_secs(),
            grace_secs: policy.grace.as_secs(),
            connectivity_check: policy.connectivity_check,
        };
        self.append(JournalRecord::Opened {
            change: ChangeRecord::from_change(&change),
        })?;
        self.next_seq += 1;
        info!(
            change = %id,
            category,
            path = %path.display(),
            timeout_secs = change.timeout_secs,
            "change opened, awaiting confirmation"
        );
        self.changes.insert(id.clone(), change);
        Ok(vec![Effect::ScheduleDeadline { id, due: deadline }])
    }

    /// Administrator confirm. Honored in OPEN and GRACE.
    pub fn confirm(
        &mut self,
        id: &ChangeId,
        actor: &str,
        now: Instant,
    ) -> Result<Vec<Effect>, LedgerError> {
        let change = self
            .changes
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        if !change.state.is_confirmable() {
            return Err(LedgerError::NotConfirmable {
                id: id.clone(),
                state: change.state,
            });
        }
        self.append(JournalRecord::Confirmed {
            id: id.clone(),
            actor: actor.to_string(),
            at_ms: crate::wall_ms(),
        })?;

        let change = self.changes.get_mut(id).expect("existence checked above");
        change.state = ChangeState::Confirmed;
        change.terminal_at_ms = Some(crate::wall_ms());
        let category = change.category.clone();
        let digests = change.observed_digests.clone();
        info!(change = %id, actor, "change confirmed");

        // The confirmed content is the new accepted state.
        for (path, digest) in digests {
            self.baselines.insert(path, digest);
        }

        let mut effects = vec![Effect::CancelTimers { id: id.clone() }];
        if self.refresh_is_safe(&category, now) {
            effects.push(Effect::RefreshBaseline { category });
        }
        Ok(effects)
    }

    /// Administrator cancel: an immediate revert, skipping grace.
    pub fn cancel(
        &mut self,
        id: &ChangeId,
        actor: &str,
    ) -> Result<Vec<Effect>, LedgerError> {
        let change = self
            .changes
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        if !change.state.is_confirmable() {
            return Err(LedgerError::NotConfirmable {
                id: id.clone(),
                state: change.state,
            });
        }
        self.append(JournalRecord::Cancelled {
            id: id.clone(),
            actor: actor.to_string(),
            at_ms: crate::wall_ms(),
        })?;

        let change = self.changes.get_mut(id).expect("existence checked above");
        change.state = ChangeState::Reverting;
        info!(change = %id, actor, "change cancelled, reverting now");
        let change = self.changes.get(id).expect("change just updated");
        let revert = self.revert_effect(change);
        Ok(vec![Effect::CancelTimers { id: id.clone() }, revert])
    }

    /// Confirmation window expired.
    ///
    /// Discarded silently unless the change is still OPEN: the fire may race
    /// with a confirm that was dequeued first.
    pub fn deadline_fired(
        &mut self,
        id: &ChangeId,
        now: Instant,
    ) -> Result<Vec<Effect>, LedgerError> {
        let Some(change) = self.changes.get(id) else {
            return Ok(Vec::new());
        };
        if change.state != ChangeState::Open {
            debug!(change = %id, state = %change.state, "stale deadline fire discarded");
            return Ok(Vec::new());
        }
        let grace = Duration::from_secs(change.grace_secs);
        let probe = change.connectivity_check;
        let grace_wall = crate::wall_ms() + grace.as_millis() as u64;
        self.append(JournalRecord::DeadlineFired {
            id: id.clone(),
            grace_deadline_wall_ms: grace_wall,
            at_ms: crate::wall_ms(),
        })?;

        let due = now + grace;
        let change = self.changes.get_mut(id).expect("existence checked above");
        change.state = ChangeState::Grace;
        change.grace_deadline = Some(due);
        change.grace_deadline_wall_ms = Some(grace_wall);
        warn!(
            change = %id,
            grace_secs = change.grace_secs,
            "confirmation window expired, entering grace"
        );

        let mut effects = vec![Effect::ScheduleGrace {
            id: id.clone(),
            due,
        }];
        if probe {
            // Half the grace period, so the result lands before grace_fired.
            effects.push(Effect::LaunchProbe {
                id: id.clone(),
                budget: grace / 2,
            });
        }
        Ok(effects)
    }

    /// Grace window expired. Confirm wins if it was dequeued first.
    pub fn grace_fired(&mut self, id: &ChangeId) -> Result<Vec<Effect>, LedgerError> {
        let Some(change) = self.changes.get(id) else {
            return Ok(Vec::new());
        };
        if change.state != ChangeState::Grace {
            debug!(change = %id, state = %change.state, "stale grace fire discarded");
            return Ok(Vec::new());
        }

        let action = self
            .policies
            .get(&change.category)
            .map(|p| p.timeout_action)
            .unwrap_or(TimeoutAction::Revert);
        if action == TimeoutAction::Warn {
            // Grace is a human window; with the warn action the human chose
            // loud acceptance over rollback.
            self.append(JournalRecord::Confirmed {
                id: id.clone(),
                actor: "timeout-warn".into(),
                at_ms: crate::wall_ms(),
            })?;
            let change = self.changes.get_mut(id).expect("existence checked above");
            change.state = ChangeState::Confirmed;
            change.terminal_at_ms = Some(crate::wall_ms());
            let digests = change.observed_digests.clone();
            error!(
                change = %id,
                "UNCONFIRMED change accepted (timeout_action=warn); review required"
            );
            for (path, digest) in digests {
                self.baselines.insert(path, digest);
            }
            return Ok(Vec::new());
        }

        self.append(JournalRecord::GraceFired {
            id: id.clone(),
            at_ms: crate::wall_ms(),
        })?;
        let change = self.changes.get_mut(id).expect("existence checked above");
        change.state = ChangeState::Reverting;
        warn!(change = %id, "grace expired without confirmation, reverting");
        let change = self.changes.get(id).expect("change just updated");
        Ok(vec![self.revert_effect(change)])
    }

    /// Probe result while the change sits in grace. Recorded and logged;
    /// never cancels the revert.
    pub fn probe_observed(&mut self, id: &ChangeId, result: Reachability) {
        let Some(change) = self.changes.get_mut(id) else {
            return;
        };
        if change.state != ChangeState::Grace {
            return;
        }
        if result.reachable {
            info!(change = %id, "host reachable during grace; revert proceeds unless confirmed");
        } else {
            warn!(change = %id, "host UNREACHABLE during grace; the change likely broke connectivity");
        }
        change.reachability = Some(result);
    }

    /// Revert engine completion.
    pub fn revert_finished(
        &mut self,
        id: &ChangeId,
        outcome: Result<(), String>,
    ) -> Result<Vec<Effect>, LedgerError> {
        let Some(change) = self.changes.get(id) else {
            warn!(change = %id, "revert finished for unknown change");
            return Ok(Vec::new());
        };
        if change.state != ChangeState::Reverting {
            warn!(change = %id, state = %change.state, "revert finished in unexpected state");
            return Ok(Vec::new());
        }
        let (success, reason) = match outcome {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        };
        self.append(JournalRecord::RevertFinished {
            id: id.clone(),
            success,
            reason: reason.clone(),
            at_ms: crate::wall_ms(),
        })?;

        let change = self.changes.get_mut(id).expect("existence checked above");
        if success {
            change.state = ChangeState::Reverted;
            info!(change = %id, "change reverted to pre-change state");
        } else {
            change.state = ChangeState::Failed;
            error!(
                change = %id,
                reason = %reason.as_deref().unwrap_or("unknown"),
                "REVERT FAILED; manual operator intervention required"
            );
        }
        change.terminal_at_ms = Some(crate::wall_ms());
        Ok(Vec::new())
    }

    /// Swap in freshly compiled policies (configuration reload).
    pub fn reload_policies(&mut self, policies: BTreeMap<String, CategoryPolicy>) {
        info!(categories = policies.len(), "policies reloaded");
        self.policies = policies;
    }

    /// Purge terminal changes older than the audit window.
    pub fn purge_expired(&mut self) -> Result<(), LedgerError> {
        let now_wall = crate::wall_ms();
        let expired: Vec<ChangeId> = self
            .changes
            .iter()
            .filter(|(_, c)| {
                c.terminal_at_ms.is_some_and(|t| {
                    now_wall.saturating_sub(t) > AUDIT_WINDOW.as_millis() as u64
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.append(JournalRecord::Purged {
                id: id.clone(),
                at_ms: now_wall,
            })?;
            self.changes.remove(&id);
        }
        Ok(())
    }

    // === Safe mode ===

    /// Fail closed: event delivery can no longer be trusted, so no new
    /// confirmation windows open. Existing changes keep running. Exit is
    /// manual (daemon restart).
    pub fn enter_safe_mode(&mut self, reason: &str) {
        if !self.safe_mode {
            error!(reason, "entering safe-mode: new changes refused");
        }
        self.safe_mode = true;
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode
    }

    // === Queries ===

    pub fn get(&self, id: &ChangeId) -> Option<&PendingChange> {
        self.changes.get(id)
    }

    /// Changes, optionally filtered to the live (non-terminal) set.
    pub fn list(&self, live_only: bool) -> Vec<&PendingChange> {
        self.changes
            .values()
            .filter(|c| !live_only || !c.state.is_terminal())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.changes
            .values()
            .filter(|c| c.state == ChangeState::Open)
            .count()
    }

    pub fn grace_count(&self) -> usize {
        self.changes
            .values()
            .filter(|c| c.state == ChangeState::Grace)
            .count()
    }

    // === Journal maintenance ===

    pub fn wants_compaction(&self) -> bool {
        self.journal.wants_compaction()
    }

    pub fn compact(&mut self) -> Result<(), LedgerError> {
        let changes = self.changes.values().map(ChangeRecord::from_change).collect();
        self.journal.compact(self.next_seq, changes)
    }

    // === Internals ===

    fn covering_change(&self, path: &Path) -> Option<ChangeId> {
        self.changes
            .values()
            .find(|c| !c.state.is_terminal() && c.paths.contains(path))
            .map(|c| c.id.clone())
    }

    fn coalescible_change(&self, category: &str, now: Instant) -> Option<ChangeId> {
        self.changes
            .values()
            .find(|c| {
                c.state == ChangeState::Open
                    && c.category == category
                    && now.saturating_duration_since(c.last_event) <= COALESCE_WINDOW
            })
            .map(|c| c.id.clone())
    }

    fn merge_event(
        &mut self,
        id: &ChangeId,
        path: PathBuf,
        digest: Option<String>,
        now: Instant,
    ) -> Result<(), LedgerError> {
        self.append(JournalRecord::Merged {
            id: id.clone(),
            path: path.clone(),
            digest: digest.clone(),
            at_ms: crate::wall_ms(),
        })?;
        let Some(change) = self.changes.get_mut(id) else {
            return Ok(());
        };
        debug!(change = %id, path = %path.display(), "event coalesced into open change");
        change.record_event(path, digest, now);
        Ok(())
    }

    /// Refreshing the baseline captures current disk content; that is only
    /// the accepted state when no other live change is mid-flight in the
    /// category.
    fn refresh_is_safe(&self, category: &str, _now: Instant) -> bool {
        !self
            .changes
            .values()
            .any(|c| c.category == category && !c.state.is_terminal())
    }

    fn revert_effect(&self, change: &PendingChange) -> Effect {
        let services = self
            .policies
            .get(&change.category)
            .map(|p| p.restart_services.clone())
            .unwrap_or_default();
        Effect::StartRevert {
            id: change.id.clone(),
            snapshot_id: change.snapshot_id.clone(),
            paths: change.paths.iter().cloned().collect(),
            services,
        }
    }

    /// Append one record to the journal. The caller mutates in-memory state
    /// only after this succeeds.
    fn append(&mut self, record: JournalRecord) -> Result<(), LedgerError> {
        self.journal.append(&record)
    }
}

fn apply_record(
    folded: &mut BTreeMap<ChangeId, ChangeRecord>,
    record: JournalRecord,
) -> Result<(), LedgerError> {
    let missing = |id: &ChangeId, what: &str| LedgerError::ReplayInconsistent {
        reason: format!("{what} for unknown change {id}"),
    };
    match record {
        JournalRecord::Opened { change } => {
            folded.insert(change.id.clone(), change);
        }
        JournalRecord::Merged { id, path, digest, .. } => {
            let change = folded.get_mut(&id).ok_or_else(|| missing(&id, "merge"))?;
            change.paths.insert(path.clone());
            change.observed_digests.retain(|(p, _)| p != &path);
            change.observed_digests.push((path, digest));
        }
        JournalRecord::Confirmed { id, at_ms, .. } => {
            let change = folded.get_mut(&id).ok_or_else(|| missing(&id, "confirm"))?;
            change.state = ChangeState::Confirmed;
            change.terminal_at_ms = Some(at_ms);
        }
        JournalRecord::Cancelled { id, .. } => {
            let change = folded.get_mut(&id).ok_or_else(|| missing(&id, "cancel"))?;
            change.state = ChangeState::Reverting;
        }
        JournalRecord::DeadlineFired {
            id,
            grace_deadline_wall_ms,
            ..
        } => {
            let change = folded
                .get_mut(&id)
                .ok_or_else(|| missing(&id, "deadline fire"))?;
            change.state = ChangeState::Grace;
            change.grace_deadline_wall_ms = Some(grace_deadline_wall_ms);
        }
        JournalRecord::GraceFired { id, .. } => {
            let change = folded
                .get_mut(&id)
                .ok_or_else(|| missing(&id, "grace fire"))?;
            change.state = ChangeState::Reverting;
        }
        JournalRecord::RevertFinished {
            id, success, at_ms, ..
        } => {
            let change = folded
                .get_mut(&id)
                .ok_or_else(|| missing(&id, "revert completion"))?;
            change.state = if success {
                ChangeState::Reverted
            } else {
                ChangeState::Failed
            };
            change.terminal_at_ms = Some(at_ms);
        }
        JournalRecord::Purged { id, .. } => {
            folded.remove(&id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policies() -> BTreeMap<String, CategoryPolicy> {
        let mut map = BTreeMap::new();
        for (name, timeout, services, probe) in [
            ("ssh", 900, vec!["sshd".to_string()], false),
            ("firewall", 300, vec!["ufw".to_string()], true),
            ("network", 600, vec!["networking".to_string()], true),
            ("services", 300, vec![], false),
        ] {
            map.insert(
                name.to_string(),
                CategoryPolicy {
                    name: name.to_string(),
                    timeout: Duration::from_secs(timeout),
                    grace: Duration::from_secs(30),
                    connectivity_check: probe,
                    restart_services: services,
                    timeout_action: TimeoutAction::Revert,
                },
            );
        }
        map
    }

    fn ledger(dir: &TempDir) -> Ledger {
        let (mut ledger, effects) =
            Ledger::open(dir.path(), policies(), false, Instant::now()).unwrap();
        assert!(effects.is_empty());
        ledger.baseline_captured(
            "ssh",
            SnapshotId("00000001-aaaa".into()),
            vec![(PathBuf::from("/etc/ssh/sshd_config"), Some("old".into()))],
        );
        ledger.baseline_captured(
            "firewall",
            SnapshotId("00000002-bbbb".into()),
            vec![(PathBuf::from("/etc/iptables/rules.v4"), Some("old".into()))],
        );
        ledger.baseline_captured("services", SnapshotId("00000003-cccc".into()), vec![]);
        ledger
    }

    fn sshd() -> PathBuf {
        PathBuf::from("/etc/ssh/sshd_config")
    }

    #[test]
    fn open_then_confirm_updates_baseline() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        let effects = ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        assert!(matches!(effects[0], Effect::ScheduleDeadline { .. }));
        let id = ChangeId("ssh_1".into());
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Open);

        let effects = ledger.confirm(&id, "root", now).unwrap();
        assert!(effects.contains(&Effect::CancelTimers { id: id.clone() }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RefreshBaseline { category } if category == "ssh")));
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Confirmed);
        // Post-edit digest became the accepted baseline, so the same bytes
        // arriving again are a no-op.
        let effects = ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn noop_write_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let effects =
            ledger.on_change_event("ssh", sshd(), Some("old".into()), Instant::now()).unwrap();
        assert!(effects.is_empty());
        assert!(ledger.list(true).is_empty());
    }

    #[test]
    fn unknown_category_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let effects = ledger.on_change_event(
            "nonsense",
            PathBuf::from("/etc/whatever"),
            Some("x".into()),
            Instant::now(),
        ).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn missing_baseline_means_no_change_opened() {
        let dir = TempDir::new().unwrap();
        let (mut ledger, _) =
            Ledger::open(dir.path(), policies(), false, Instant::now()).unwrap();
        let effects = ledger.on_change_event("ssh", sshd(), Some("new".into()), Instant::now()).unwrap();
        assert!(effects.is_empty());
        assert!(ledger.list(true).is_empty());
    }

    #[test]
    fn coalescing_keeps_the_original_deadline() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        let a = PathBuf::from("/etc/systemd/system/a.service");
        let b = PathBuf::from("/etc/systemd/system/b.service");
        ledger.on_change_event("services", a.clone(), Some("da".into()), now).unwrap();
        let id = ChangeId("services_1".into());
        let deadline = ledger.get(&id).unwrap().deadline;

        // 5 s later: second edit coalesces, deadline unchanged.
        let effects =
            ledger.on_change_event("services", b.clone(), Some("db".into()), now + Duration::from_secs(5)).unwrap();
        assert!(effects.is_empty());
        let change = ledger.get(&id).unwrap();
        assert!(change.paths.contains(&a) && change.paths.contains(&b));
        assert_eq!(change.deadline, deadline);
        assert_eq!(ledger.list(true).len(), 1);
    }

    #[test]
    fn event_outside_window_opens_second_change() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        let a = PathBuf::from("/etc/systemd/system/a.service");
        let b = PathBuf::from("/etc/systemd/system/b.service");
        ledger.on_change_event("services", a, Some("da".into()), now).unwrap();
        ledger.on_change_event(
            "services",
            b,
            Some("db".into()),
            now + COALESCE_WINDOW + Duration::from_secs(1),
        ).unwrap();
        assert_eq!(ledger.list(true).len(), 2);
    }

    #[test]
    fn same_path_reedit_merges_despite_expired_window() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("v1".into()), now).unwrap();
        // Much later, same path again: stays in the one covering change.
        ledger.on_change_event(
            "ssh",
            sshd(),
            Some("v2".into()),
            now + Duration::from_secs(120),
        ).unwrap();
        assert_eq!(ledger.list(true).len(), 1);
        let change = ledger.get(&ChangeId("ssh_1".into())).unwrap();
        assert_eq!(
            change.observed_digests,
            vec![(sshd(), Some("v2".to_string()))]
        );
    }

    #[test]
    fn deadline_then_grace_then_revert() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event(
            "firewall",
            PathBuf::from("/etc/iptables/rules.v4"),
            Some("new".into()),
            now,
        ).unwrap();
        let id = ChangeId("firewall_1".into());

        let effects = ledger.deadline_fired(&id, now + Duration::from_secs(300)).unwrap();
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Grace);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleGrace { .. })));
        // firewall policy probes connectivity; budget is half the grace.
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::LaunchProbe { budget, .. } if *budget == Duration::from_secs(15)
        )));

        // Positive probe is recorded but does not cancel the revert.
        ledger.probe_observed(
            &id,
            Reachability {
                reachable: true,
                latencies_ms: vec![("8.8.8.8".into(), 12)],
                observed_at_ms: 0,
            },
        );

        let effects = ledger.grace_fired(&id).unwrap();
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Reverting);
        match &effects[0] {
            Effect::StartRevert { services, paths, .. } => {
                assert_eq!(services, &vec!["ufw".to_string()]);
                assert_eq!(paths, &vec![PathBuf::from("/etc/iptables/rules.v4")]);
            }
            other => panic!("unexpected effect: {other:?}"),
        }

        ledger.revert_finished(&id, Ok(())).unwrap();
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Reverted);
    }

    #[test]
    fn confirm_wins_over_queued_grace_fire() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        ledger.deadline_fired(&id, now).unwrap();
        ledger.confirm(&id, "root", now).unwrap();

        // The grace fire dequeued after the confirm is discarded.
        let effects = ledger.grace_fired(&id).unwrap();
        assert!(effects.is_empty());
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Confirmed);
    }

    #[test]
    fn stale_deadline_fire_after_confirm_is_discarded() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        ledger.confirm(&id, "root", now).unwrap();
        assert!(ledger.deadline_fired(&id, now).unwrap().is_empty());
    }

    #[test]
    fn confirm_on_terminal_change_names_current_state() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        ledger.confirm(&id, "root", now).unwrap();
        match ledger.confirm(&id, "root", now) {
            Err(LedgerError::NotConfirmable { state, .. }) => {
                assert_eq!(state, ChangeState::Confirmed)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cancel_skips_grace() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        let effects = ledger.cancel(&id, "root").unwrap();
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Reverting);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartRevert { .. })));
    }

    #[test]
    fn failed_revert_is_terminal_and_surfaced() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        ledger.cancel(&id, "root").unwrap();
        ledger.revert_finished(&id, Err("disk full".into())).unwrap();
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Failed);
        // No automatic retry.
        assert!(ledger.grace_fired(&id).unwrap().is_empty());
    }

    #[test]
    fn safe_mode_refuses_new_changes_but_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let now = Instant::now();

        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        ledger.enter_safe_mode("watcher degraded");

        let effects = ledger.on_change_event(
            "firewall",
            PathBuf::from("/etc/iptables/rules.v4"),
            Some("x".into()),
            now,
        ).unwrap();
        assert!(effects.is_empty());
        assert_eq!(ledger.list(true).len(), 1);
        // The pre-existing window still honors confirm.
        ledger.confirm(&ChangeId("ssh_1".into()), "root", now).unwrap();
    }

    #[test]
    fn warn_action_accepts_instead_of_reverting() {
        let dir = TempDir::new().unwrap();
        let mut map = policies();
        map.get_mut("ssh").unwrap().timeout_action = TimeoutAction::Warn;
        let (mut ledger, _) = Ledger::open(dir.path(), map, false, Instant::now()).unwrap();
        ledger.baseline_captured(
            "ssh",
            SnapshotId("00000001-aaaa".into()),
            vec![(sshd(), Some("old".into()))],
        );

        let now = Instant::now();
        ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        let id = ChangeId("ssh_1".into());
        ledger.deadline_fired(&id, now).unwrap();
        let effects = ledger.grace_fired(&id).unwrap();
        assert!(effects.is_empty());
        assert_eq!(ledger.get(&id).unwrap().state, ChangeState::Confirmed);
    }

    #[test]
    fn replay_resumes_open_and_reverting_changes() {
        let dir = TempDir::new().unwrap();
        let now = Instant::now();
        {
            let mut ledger = ledger(&dir);
            ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
            ledger.on_change_event(
                "firewall",
                PathBuf::from("/etc/iptables/rules.v4"),
                Some("fw".into()),
                now,
            ).unwrap();
            let fw = ChangeId("firewall_2".into());
            ledger.deadline_fired(&fw, now).unwrap();
            ledger.grace_fired(&fw).unwrap();
            // Daemon dies mid-revert here.
        }

        let (ledger, effects) = Ledger::open(dir.path(), policies(), false, now).unwrap();
        assert_eq!(ledger.list(true).len(), 2);
        assert_eq!(
            ledger.get(&ChangeId("ssh_1".into())).unwrap().state,
            ChangeState::Open
        );
        assert_eq!(
            ledger.get(&ChangeId("firewall_2".into())).unwrap().state,
            ChangeState::Reverting
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleDeadline { id, .. } if id.as_str() == "ssh_1")));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartRevert { id, .. } if id.as_str() == "firewall_2")));
        // Category baselines re-established from the resumed changes.
        assert!(ledger.has_baseline("ssh"));
        assert!(ledger.has_baseline("firewall"));
    }

    #[test]
    fn replay_matches_live_state_from_any_prefix() {
        let dir = TempDir::new().unwrap();
        let now = Instant::now();
        let mut live = ledger(&dir);
        live.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
        live.confirm(&ChangeId("ssh_1".into()), "root", now).unwrap();
        live.on_change_event(
            "firewall",
            PathBuf::from("/etc/iptables/rules.v4"),
            Some("fw".into()),
            now,
        ).unwrap();
        drop(live);

        let (replayed, _) = Ledger::open(dir.path(), policies(), false, now).unwrap();
        assert_eq!(
            replayed.get(&ChangeId("ssh_1".into())).unwrap().state,
            ChangeState::Confirmed
        );
        assert_eq!(
            replayed.get(&ChangeId("firewall_2".into())).unwrap().state,
            ChangeState::Open
        );
        // Fresh ids keep counting upward after replay.
        assert_eq!(replayed.next_seq, 3);
    }

    #[test]
    fn compaction_preserves_replay() {
        let dir = TempDir::new().unwrap();
        let now = Instant::now();
        {
            let mut ledger = ledger(&dir);
            ledger.on_change_event("ssh", sshd(), Some("new".into()), now).unwrap();
            ledger.compact().unwrap();
        }
        let (replayed, effects) = Ledger::open(dir.path(), policies(), false, now).unwrap();
        assert_eq!(
            replayed.get(&ChangeId("ssh_1".into())).unwrap().state,
            ChangeState::Open
        );
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn journal_write_failure_refuses_to_open_a_change() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let (mut ledger, _) =
            Ledger::open(&state, policies(), false, Instant::now()).unwrap();
        ledger.baseline_captured(
            "ssh",
            SnapshotId("00000001-aaaa".into()),
            vec![(sshd(), Some("old".into()))],
        );

        // Break the journal: its directory disappears before the first
        // append, so the durable record cannot be written.
        std::fs::remove_dir_all(&state).unwrap();
        let result = ledger.on_change_event("ssh", sshd(), Some("new".into()), Instant::now());
        assert!(matches!(result, Err(LedgerError::Journal { .. })));
        // No half-tracked state survives: the change was not opened.
        assert!(ledger.list(true).is_empty());
    }

    #[test]
    fn force_reset_clears_bad_journal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ledger.log"), "garbage\n").unwrap();
        assert!(Ledger::open(dir.path(), policies(), false, Instant::now()).is_err());
        let (ledger, _) = Ledger::open(dir.path(), policies(), true, Instant::now()).unwrap();
        assert!(ledger.list(false).is_empty());
    }
}
