//! Daemon runner.
//!
//! `revertit daemon run` starts the service: loads and validates the
//! configuration (invalid config is fatal), detects the host, replays the
//! ledger, and spawns the worker, watcher, and state threads around the
//! accept loop. SIGTERM/SIGINT drain in-flight work and compact the journal.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::core::Daemon;
use super::ipc::Request;
use super::server::{handle_client, run_state_loop, RequestMessage};
use crate::classify::PathClassifier;
use crate::config::{self, Config};
use crate::host::{self, ServiceManager};
use crate::ledger::{CategoryPolicy, Ledger};
use crate::revert::{run_worker_loop, RevertWorker, WorkerOp, WorkerResult};
use crate::snapshot::SnapshotStore;
use crate::watch::{run_watch_loop, Suppressor, WatchEvent};
use crate::Result;

/// Build the per-category policies from config and host capabilities.
pub fn build_policies(
    config: &Config,
    descriptor: &host::HostDescriptor,
) -> std::collections::BTreeMap<String, CategoryPolicy> {
    config
        .monitoring
        .iter()
        .map(|(category, _)| {
            (
                category.clone(),
                CategoryPolicy {
                    name: category.clone(),
                    timeout: Duration::from_secs(config.timeout_for(category)),
                    grace: Duration::from_secs(config.timeout.revert_grace_period),
                    connectivity_check: config.timeout.connectivity_check,
                    restart_services: host::default_restart_services(category, descriptor),
                    timeout_action: config.timeout.timeout_action,
                },
            )
        })
        .collect()
}

/// Run the daemon in the current process. Returns when a shutdown signal or
/// a `shutdown` control request arrives.
pub fn run_daemon(config_path: &Path, force_reset: bool) -> Result<()> {
    let config = config::load_or_init(config_path)?;
    crate::telemetry::init(config.global.log_level);
    info!(config = %config_path.display(), "revertit daemon starting");

    let descriptor = host::detect();
    info!(
        family = %descriptor.distro_family,
        init = %descriptor.init_system,
        "host detected"
    );

    let policies = build_policies(&config, &descriptor);
    let classifier = PathClassifier::new(&config.monitoring);
    let suppressor = Suppressor::new();

    // Worker thread: owns the snapshot store, the restart capability, and
    // every blocking operation.
    let store = SnapshotStore::open(&config.snapshot.location, config.snapshot.enable_system_tool)?;
    let worker = RevertWorker::new(
        store,
        Box::new(ServiceManager::new(descriptor.init_system)),
        suppressor.clone(),
        descriptor.clone(),
        config.timeout.connectivity_endpoints.clone(),
        Duration::from_secs(config.timeout.connectivity_timeout.max(1)),
        config.snapshot.max_snapshots,
        config.snapshot.max_age_days,
    );
    let (worker_tx, worker_rx) = crossbeam::channel::unbounded::<WorkerOp>();
    let (worker_result_tx, worker_result_rx) = crossbeam::channel::unbounded::<WorkerResult>();
    let worker_handle = std::thread::spawn(move || {
        run_worker_loop(worker, worker_rx, worker_result_tx);
    });

    // Ledger replay; LedgerReplayInconsistent is fatal without --force-reset.
    let (ledger, resume) = Ledger::open(
        &config.global.state_dir,
        policies,
        force_reset,
        Instant::now(),
    )?;

    let mut daemon = Daemon::new(
        ledger,
        classifier,
        config.clone(),
        config_path.to_path_buf(),
        descriptor,
        worker_tx.clone(),
    );
    daemon.bootstrap(resume);

    // Watcher thread.
    let (watch_tx, watch_rx) = crossbeam::channel::unbounded::<WatchEvent>();
    {
        let watch_classifier = PathClassifier::new(&config.monitoring);
        let roots = watch_classifier.watch_roots();
        let suppressor = suppressor.clone();
        let watch_tx_clone = watch_tx.clone();
        std::thread::spawn(move || {
            let interesting = move |path: &Path| watch_classifier.classify(path).is_some();
            if let Err(e) = run_watch_loop(roots, interesting, suppressor, watch_tx_clone.clone()) {
                error!("watcher failed to start: {e}");
                let _ = watch_tx_clone.send(WatchEvent::Degraded {
                    reason: e.to_string(),
                });
            }
        });
    }

    // Control socket, root-owned, mode 0600.
    let socket_path = config.global.socket_path.clone();
    if UnixStream::connect(&socket_path).is_ok() {
        warn!("daemon already running on {}", socket_path.display());
        return Ok(());
    }
    let _ = std::fs::remove_file(&socket_path);
    if let Some(dir) = socket_path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let listener = UnixListener::bind(&socket_path).map_err(crate::daemon::IpcError::from)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600));
    }
    info!(socket = %socket_path.display(), "control socket listening");

    // Signal handling: flags the accept loop polls, as usual.
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone());

    // State thread. It shares the shutdown flag so a `shutdown` control
    // request also stops the accept loop.
    let (req_tx, req_rx) = crossbeam::channel::unbounded::<RequestMessage>();
    let state_shutdown = shutdown.clone();
    let state_handle = std::thread::spawn(move || {
        run_state_loop(daemon, req_rx, watch_rx, worker_result_rx, state_shutdown);
    });

    listener
        .set_nonblocking(true)
        .map_err(crate::daemon::IpcError::from)?;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown signal received");
            break;
        }
        if reload.swap(false, Ordering::Relaxed) {
            info!("SIGHUP received, reloading policies");
            let (respond_tx, _respond_rx) = crossbeam::channel::bounded(1);
            let _ = req_tx.send(RequestMessage {
                request: Request::ReloadPolicies,
                respond: respond_tx,
            });
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let req_tx = req_tx.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_client(stream, req_tx);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }

    // Ask the state thread to finish cleanly (compacts the journal, stops
    // the worker after in-flight reverts drain from its queue).
    let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
    let _ = req_tx.send(RequestMessage {
        request: Request::Shutdown,
        respond: respond_tx,
    });
    let _ = respond_rx.recv_timeout(Duration::from_secs(10));
    drop(req_tx);
    drop(watch_tx);

    let _ = state_handle.join();
    let _ = worker_handle.join();
    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped");
    Ok(())
}
