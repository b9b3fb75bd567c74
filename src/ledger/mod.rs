//! Change ledger: the single owner of pending-change state.
//!
//! Every mutation (watcher events, administrator commands, timer fires,
//! worker completions) arrives serialized through the daemon state thread
//! and lands here. The ledger mutates its map, appends to the journal, and
//! hands back the side effects the caller must carry out (timer scheduling,
//! probe launches, reverts); it performs no I/O beyond its own journal.

mod change;
mod core;
mod journal;

pub use change::{CategoryPolicy, ChangeId, ChangeRecord, ChangeState, PendingChange};
pub use journal::{Journal, JournalRecord, LedgerSnapshot};
pub use self::core::{Effect, Ledger};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("change not found: {0}")]
    NotFound(ChangeId),

    #[error("change {id} is {state}, not confirmable")]
    NotConfirmable { id: ChangeId, state: ChangeState },

    #[error("journal error on {path}: {reason}")]
    Journal { path: PathBuf, reason: String },

    #[error("ledger replay inconsistent: {reason}")]
    ReplayInconsistent { reason: String },
}
