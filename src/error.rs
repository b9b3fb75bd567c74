use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::IpcError;
use crate::ledger::LedgerError;
use crate::revert::RevertError;
use crate::snapshot::SnapshotError;
use crate::watch::WatchError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors, not a god error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Revert(#[from] RevertError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) | Error::Ledger(_) => Transience::Permanent,
            Error::Snapshot(e) => e.transience(),
            Error::Revert(e) => e.transience(),
            Error::Watch(_) | Error::Ipc(_) | Error::Io(_) => Transience::Retryable,
        }
    }
}
