#![forbid(unsafe_code)]

//! revertit - timed-confirmation safety daemon for Linux configuration edits.
//!
//! The daemon watches a curated set of system configuration files (network,
//! SSH, firewall, services), snapshots each file before an edit takes effect
//! operationally, and opens a bounded confirmation window. If the
//! administrator does not confirm in time, the prior state is restored and
//! the affected services are restarted, so a remote mistake cannot lock the
//! operator out.

pub mod classify;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod ledger;
pub mod paths;
pub mod revert;
pub mod snapshot;
pub mod telemetry;
pub mod timer;
pub mod watch;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use classify::PathClassifier;
pub use host::{HostDescriptor, Reachability, RestartOutcome};
pub use ledger::{ChangeId, ChangeState, Ledger, PendingChange};
pub use snapshot::{SnapshotId, SnapshotOrigin, SnapshotStore};
pub use timer::{DeadlineKind, TimeoutEngine};

/// Milliseconds since the Unix epoch, the crate's wall-clock representation.
pub fn wall_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
