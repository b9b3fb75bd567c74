//! Timeout engine.
//!
//! A min-heap of `(monotonic deadline, change id, kind)`. The state loop
//! turns `next_deadline()` into its select tick and feeds due entries back
//! into the ledger as commands; nothing executes here. Deadlines are
//! `Instant`s, so wall-clock adjustments cannot shorten or extend a window.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::ledger::ChangeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeadlineKind {
    /// End of the confirmation window.
    Deadline,
    /// End of the grace period.
    Grace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    due: Instant,
    change_id: ChangeId,
    kind: DeadlineKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.change_id.cmp(&other.change_id))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A fired timer event, handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub change_id: ChangeId,
    pub kind: DeadlineKind,
}

#[derive(Default)]
pub struct TimeoutEngine {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Lazily-deleted entries; `cancel` records them here and `pop_due`
    /// skips them, the usual trick for heaps without random removal.
    cancelled: Vec<(ChangeId, DeadlineKind)>,
}

impl TimeoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, change_id: ChangeId, kind: DeadlineKind) {
        // Re-scheduling replaces any pending entry of the same kind.
        self.cancel(&change_id, kind);
        self.heap.push(Reverse(Entry {
            due,
            change_id,
            kind,
        }));
    }

    pub fn cancel(&mut self, change_id: &ChangeId, kind: DeadlineKind) {
        if self
            .heap
            .iter()
            .any(|Reverse(e)| &e.change_id == change_id && e.kind == kind)
        {
            self.cancelled.push((change_id.clone(), kind));
        }
    }

    /// Earliest pending deadline, for the select tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|Reverse(e)| !self.is_cancelled(e))
            .map(|Reverse(e)| e.due)
            .min()
    }

    /// Pop every entry due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Fired> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            if self.take_cancelled(&entry) {
                continue;
            }
            fired.push(Fired {
                change_id: entry.change_id,
                kind: entry.kind,
            });
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap
            .iter()
            .all(|Reverse(e)| self.is_cancelled(e))
    }

    fn is_cancelled(&self, entry: &Entry) -> bool {
        self.cancelled
            .iter()
            .any(|(id, kind)| id == &entry.change_id && *kind == entry.kind)
    }

    fn take_cancelled(&mut self, entry: &Entry) -> bool {
        if let Some(pos) = self
            .cancelled
            .iter()
            .position(|(id, kind)| id == &entry.change_id && *kind == entry.kind)
        {
            self.cancelled.swap_remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> ChangeId {
        ChangeId(s.to_string())
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut engine = TimeoutEngine::new();
        let now = Instant::now();
        engine.schedule(now + Duration::from_secs(2), id("ssh_2"), DeadlineKind::Deadline);
        engine.schedule(now + Duration::from_secs(1), id("ssh_1"), DeadlineKind::Deadline);

        let fired = engine.pop_due(now + Duration::from_secs(3));
        assert_eq!(
            fired.iter().map(|f| f.change_id.0.as_str()).collect::<Vec<_>>(),
            vec!["ssh_1", "ssh_2"]
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn nothing_fires_before_due() {
        let mut engine = TimeoutEngine::new();
        let now = Instant::now();
        engine.schedule(now + Duration::from_secs(5), id("fw_1"), DeadlineKind::Deadline);
        assert!(engine.pop_due(now).is_empty());
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn cancel_suppresses_fire() {
        let mut engine = TimeoutEngine::new();
        let now = Instant::now();
        engine.schedule(now, id("ssh_1"), DeadlineKind::Deadline);
        engine.schedule(now, id("ssh_1"), DeadlineKind::Grace);
        engine.cancel(&id("ssh_1"), DeadlineKind::Deadline);

        let fired = engine.pop_due(now + Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, DeadlineKind::Grace);
    }

    #[test]
    fn reschedule_replaces_pending_entry() {
        let mut engine = TimeoutEngine::new();
        let now = Instant::now();
        engine.schedule(now + Duration::from_secs(1), id("net_1"), DeadlineKind::Deadline);
        engine.schedule(now + Duration::from_secs(9), id("net_1"), DeadlineKind::Deadline);

        assert!(engine.pop_due(now + Duration::from_secs(2)).is_empty());
        let fired = engine.pop_due(now + Duration::from_secs(10));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn cancelled_entries_do_not_drive_the_tick() {
        let mut engine = TimeoutEngine::new();
        let now = Instant::now();
        engine.schedule(now + Duration::from_secs(1), id("a_1"), DeadlineKind::Deadline);
        engine.schedule(now + Duration::from_secs(5), id("b_1"), DeadlineKind::Deadline);
        engine.cancel(&id("a_1"), DeadlineKind::Deadline);
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(5)));
    }
}
