//! Default filesystem locations for the daemon.
//!
//! Everything here is a default; the effective locations come from the
//! configuration so tests can point the daemon at temporary directories.

use std::path::PathBuf;

/// Default configuration document.
pub fn config_path() -> PathBuf {
    PathBuf::from("/etc/meshadmin-revertit/config.yaml")
}

/// Control socket the CLI talks to.
pub fn socket_path() -> PathBuf {
    PathBuf::from("/run/meshadmin-revertit.sock")
}

/// State directory holding the ledger journal and its compacted snapshot.
pub fn state_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshadmin-revertit")
}

/// Default snapshot store location.
pub fn snapshot_dir() -> PathBuf {
    state_dir().join("snapshots")
}
