//! Filesystem watcher.
//!
//! A dedicated thread owns the `notify` watcher over every expanded watched
//! path plus the parent directories of globbed entries. Raw events land in a
//! per-path debounce map; once a path has been quiet for the debounce window
//! the thread computes the post-quiet content digest and emits a single
//! `WatchEvent` to the state loop. A rename over a watched path therefore
//! surfaces as a modification of the target, which is the common temp-file +
//! rename editor pattern.
//!
//! Paths under restore are suppressed through the shared [`Suppressor`] so a
//! revert does not observe its own writes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Per-path quiet window before an event is emitted.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to install watches: {0}")]
    Install(String),
}

/// Event delivered to the state loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A watched path settled after edits. `digest` is the SHA-256 of the
    /// post-quiet content, `None` when the path no longer exists.
    Changed {
        path: PathBuf,
        digest: Option<String>,
    },
    /// notify reported an error; event delivery can no longer be trusted.
    Degraded { reason: String },
}

/// Shared set of paths whose events are dropped at intake.
///
/// The revert engine holds one side and flags paths for the duration of a
/// restore plan; the watcher thread checks it before queueing events.
#[derive(Clone, Default)]
pub struct Suppressor {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Suppressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        let mut set = self.paths.lock().expect("suppressor lock");
        set.extend(paths.into_iter().cloned());
    }

    pub fn release<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        let mut set = self.paths.lock().expect("suppressor lock");
        for path in paths {
            set.remove(path);
        }
    }

    pub fn is_suppressed(&self, path: &Path) -> bool {
        self.paths.lock().expect("suppressor lock").contains(path)
    }
}

enum RawEvent {
    Touched(PathBuf),
    Failed(String),
}

/// Run the watcher thread until `raw` producers disappear.
///
/// `roots` are the directories to watch (non-recursive); `interesting`
/// decides which concrete paths are worth debouncing (the classifier seam).
pub fn run_watch_loop(
    roots: Vec<PathBuf>,
    interesting: impl Fn(&Path) -> bool,
    suppressor: Suppressor,
    events_tx: Sender<WatchEvent>,
) -> Result<(), WatchError> {
    let (raw_tx, raw_rx) = crossbeam::channel::unbounded::<RawEvent>();

    let callback_tx = raw_tx.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                if !is_interesting_kind(&event.kind) {
                    return;
                }
                for path in event.paths {
                    let _ = callback_tx.send(RawEvent::Touched(path));
                }
            }
            Err(e) => {
                let _ = callback_tx.send(RawEvent::Failed(e.to_string()));
            }
        }
    })
    .map_err(|e| WatchError::Install(e.to_string()))?;

    let mut installed = 0usize;
    for root in &roots {
        if !root.exists() {
            debug!(root = %root.display(), "watch root does not exist, skipping");
            continue;
        }
        match watcher.watch(root, RecursiveMode::NonRecursive) {
            Ok(()) => installed += 1,
            Err(e) => warn!(root = %root.display(), "failed to watch: {e}"),
        }
    }
    if installed == 0 {
        return Err(WatchError::Install("no watch roots could be installed".into()));
    }
    info!(roots = installed, "filesystem watcher running");

    debounce_loop(&raw_rx, &interesting, &suppressor, &events_tx);
    Ok(())
}

/// Collapse raw events into debounced `WatchEvent`s. Runs until the raw
/// channel closes (watcher dropped) or the event receiver goes away.
fn debounce_loop(
    raw_rx: &Receiver<RawEvent>,
    interesting: &impl Fn(&Path) -> bool,
    suppressor: &Suppressor,
    events_tx: &Sender<WatchEvent>,
) {
    // path -> instant the quiet window ends
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let timeout = pending
            .values()
            .min()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        match raw_rx.recv_timeout(timeout) {
            Ok(RawEvent::Touched(path)) => {
                if suppressor.is_suppressed(&path) {
                    debug!(path = %path.display(), "event suppressed during restore");
                } else if interesting(&path) {
                    // A new event resets the quiet window.
                    pending.insert(path, Instant::now() + DEBOUNCE_WINDOW);
                }
            }
            Ok(RawEvent::Failed(reason)) => {
                error!(reason = %reason, "watcher degraded");
                let _ = events_tx.send(WatchEvent::Degraded { reason });
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            pending.remove(&path);
            if suppressor.is_suppressed(&path) {
                continue;
            }
            let digest = digest_of(&path);
            if events_tx
                .send(WatchEvent::Changed { path, digest })
                .is_err()
            {
                return;
            }
        }
    }
}

fn is_interesting_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// SHA-256 of the file content, `None` when the path is gone.
pub fn digest_of(path: &Path) -> Option<String> {
    std::fs::read(path)
        .ok()
        .map(|bytes| hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn suppressor_round_trip() {
        let sup = Suppressor::new();
        let path = PathBuf::from("/etc/ssh/sshd_config");
        assert!(!sup.is_suppressed(&path));
        sup.suppress([&path]);
        assert!(sup.is_suppressed(&path));
        sup.release([&path]);
        assert!(!sup.is_suppressed(&path));
    }

    #[test]
    fn digest_none_for_missing_path() {
        assert_eq!(digest_of(Path::new("/no/such/file")), None);
    }

    #[test]
    fn watch_emits_one_debounced_event_per_burst() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("sshd_config");
        fs::write(&target, b"Port 22\n").unwrap();

        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let roots = vec![dir.path().to_path_buf()];
        let expected = target.clone();
        let handle = std::thread::spawn(move || {
            let _ = run_watch_loop(
                roots,
                move |p| p == expected,
                Suppressor::new(),
                events_tx,
            );
        });

        // Let the watches install, then write a burst of edits.
        std::thread::sleep(Duration::from_millis(200));
        for i in 0..3 {
            fs::write(&target, format!("Port 22{i}\n")).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }

        let event = events_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("debounced event");
        match event {
            WatchEvent::Changed { path, digest } => {
                assert_eq!(path, target);
                assert_eq!(digest, digest_of(&target));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The burst collapses; no second event arrives within the window.
        assert!(events_rx.recv_timeout(Duration::from_millis(700)).is_err());

        drop(events_rx);
        // Trigger one more event so the loop notices the closed channel.
        fs::write(&target, b"final\n").unwrap();
        let _ = handle.join();
    }

    #[test]
    fn rename_over_watched_path_reports_target_modification() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("rules.v4");
        fs::write(&target, b"old rules\n").unwrap();

        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        let roots = vec![dir.path().to_path_buf()];
        let expected = target.clone();
        std::thread::spawn(move || {
            let _ = run_watch_loop(
                roots,
                move |p| p == expected,
                Suppressor::new(),
                events_tx,
            );
        });
        std::thread::sleep(Duration::from_millis(200));

        // Editor pattern: write a temp file, rename it over the target.
        let temp = dir.path().join(".rules.v4.swp");
        fs::write(&temp, b"new rules\n").unwrap();
        fs::rename(&temp, &target).unwrap();

        let event = events_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("rename event");
        match event {
            WatchEvent::Changed { path, digest } => {
                assert_eq!(path, target);
                assert_eq!(digest, digest_of(&target));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
