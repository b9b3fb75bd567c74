//! Revert engine and blocking-I/O worker.
//!
//! A dedicated thread owns the snapshot store and the service-restart
//! capability, serving operations from the state thread over a channel and
//! reporting completions back as results. That keeps every blocking step
//! (captures, restores, subprocess restarts, network probes) off the ledger
//! owner.
//!
//! Restore plans execute files-first, services-last: a partially restored
//! file set with the old services still running is strictly safer than new
//! services running against new files.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::daemon::ipc::SelfTestReport;
use crate::host::{self, HostDescriptor, Reachability, RestartOutcome, ServiceRestarter};
use crate::ledger::ChangeId;
use crate::snapshot::{
    RestorePlan, RestoreStep, SnapshotError, SnapshotId, SnapshotMeta, SnapshotOrigin,
    SnapshotStore,
};
use crate::watch::Suppressor;
use crate::Transience;

/// Per-step and per-service retry budget.
const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RevertError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("restore step failed for {path}: {reason}")]
    StepFailed { path: PathBuf, reason: String },

    #[error("service {service} failed to restart: {reason}")]
    ServiceFailed { service: String, reason: String },
}

impl RevertError {
    pub fn transience(&self) -> Transience {
        match self {
            RevertError::Snapshot(e) => e.transience(),
            // The engine already retried; what bubbles up is permanent.
            RevertError::StepFailed { .. } | RevertError::ServiceFailed { .. } => {
                Transience::Permanent
            }
        }
    }
}

/// Operations the state thread sends to the worker.
pub enum WorkerOp {
    /// Capture the accepted state of a category; completion arrives as
    /// [`WorkerResult::BaselineCaptured`].
    CaptureBaseline {
        category: String,
        paths: Vec<PathBuf>,
    },
    /// Re-read an existing snapshot's digests to reseed a category baseline
    /// after a restart with live changes.
    LoadBaseline {
        category: String,
        snapshot_id: SnapshotId,
    },
    /// Operator-requested snapshot (never auto-evicted).
    CaptureManual {
        paths: Vec<PathBuf>,
        description: Option<String>,
        respond: Sender<Result<SnapshotId, String>>,
    },
    ListSnapshots {
        respond: Sender<Result<Vec<SnapshotMeta>, String>>,
    },
    /// Operator-requested full restore of a snapshot; files only, no
    /// service restarts.
    RestoreSnapshot {
        id: SnapshotId,
        respond: Sender<Result<usize, String>>,
    },
    Probe {
        id: ChangeId,
        budget: Duration,
    },
    Revert {
        id: ChangeId,
        snapshot_id: SnapshotId,
        paths: Vec<PathBuf>,
        services: Vec<String>,
    },
    SelfTest {
        watched_paths: usize,
        respond: Sender<SelfTestReport>,
    },
    Shutdown,
}

/// Completions flowing back to the state thread.
pub enum WorkerResult {
    BaselineCaptured {
        category: String,
        result: Result<(SnapshotId, Vec<(PathBuf, Option<String>)>), String>,
    },
    Probed {
        id: ChangeId,
        result: Reachability,
    },
    RevertDone {
        id: ChangeId,
        outcome: Result<(), String>,
    },
}

pub struct RevertWorker {
    store: SnapshotStore,
    restarter: Box<dyn ServiceRestarter>,
    suppressor: Suppressor,
    descriptor: HostDescriptor,
    endpoints: Vec<String>,
    probe_per_endpoint: Duration,
    retention_max: usize,
    retention_age_days: u64,
}

impl RevertWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SnapshotStore,
        restarter: Box<dyn ServiceRestarter>,
        suppressor: Suppressor,
        descriptor: HostDescriptor,
        endpoints: Vec<String>,
        probe_per_endpoint: Duration,
        retention_max: usize,
        retention_age_days: u64,
    ) -> Self {
        Self {
            store,
            restarter,
            suppressor,
            descriptor,
            endpoints,
            probe_per_endpoint,
            retention_max,
            retention_age_days,
        }
    }

    fn capture(
        &mut self,
        paths: &[PathBuf],
        origin: SnapshotOrigin,
        description: Option<String>,
    ) -> Result<(SnapshotId, Vec<(PathBuf, Option<String>)>), SnapshotError> {
        let id = self.store.snapshot_paths(paths, origin, description)?;
        let (manifest, tombstones) = self.store.manifest(&id)?;
        let mut digests: Vec<(PathBuf, Option<String>)> = manifest
            .entries
            .iter()
            .map(|e| (e.path.clone(), Some(e.digest.clone())))
            .collect();
        digests.extend(tombstones.into_iter().map(|p| (p, None)));

        if origin == SnapshotOrigin::Auto {
            if let Err(e) = self.store.retain(self.retention_max, self.retention_age_days) {
                warn!("retention failed: {e}");
            }
        }
        Ok((id, digests))
    }

    /// Execute a restore plan: temp-write + fsync + rename per file, then
    /// mode/owner fixups, then tombstone deletions.
    ///
    /// Idempotent: a write whose target already carries the expected digest
    /// is a no-op, so re-running a partially completed plan converges.
    fn execute_plan(&self, plan: &RestorePlan) -> Result<usize, RevertError> {
        let mut applied = 0;
        for step in &plan.steps {
            retry_step(step.path(), || self.execute_step(&plan.snapshot_id, step))?;
            applied += 1;
        }
        Ok(applied)
    }

    fn execute_step(&self, snapshot_id: &SnapshotId, step: &RestoreStep) -> Result<(), RevertError> {
        match step {
            RestoreStep::Write {
                path,
                digest,
                mode,
                uid,
                gid,
            } => {
                if crate::watch::digest_of(path).as_deref() == Some(digest.as_str()) {
                    debug!(path = %path.display(), "content already matches snapshot, skipping write");
                } else {
                    let bytes = self.store.read_payload(snapshot_id, digest)?;
                    let parent = path.parent().ok_or_else(|| RevertError::StepFailed {
                        path: path.clone(),
                        reason: "path has no parent directory".into(),
                    })?;
                    fs::create_dir_all(parent).map_err(|e| RevertError::StepFailed {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    let temp =
                        tempfile::NamedTempFile::new_in(parent).map_err(|e| {
                            RevertError::StepFailed {
                                path: path.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                    fs::write(temp.path(), &bytes).map_err(|e| RevertError::StepFailed {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    temp.as_file()
                        .sync_all()
                        .map_err(|e| RevertError::StepFailed {
                            path: path.clone(),
                            reason: e.to_string(),
                        })?;
                    temp.persist(path).map_err(|e| RevertError::StepFailed {
                        path: path.clone(),
                        reason: e.error.to_string(),
                    })?;
                }

                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(*mode)).map_err(|e| {
                    RevertError::StepFailed {
                        path: path.clone(),
                        reason: format!("chmod: {e}"),
                    }
                })?;
                nix::unistd::chown(
                    path,
                    Some(nix::unistd::Uid::from_raw(*uid)),
                    Some(nix::unistd::Gid::from_raw(*gid)),
                )
                .map_err(|e| RevertError::StepFailed {
                    path: path.clone(),
                    reason: format!("chown: {e}"),
                })?;
                Ok(())
            }
            RestoreStep::Remove { path } => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(RevertError::StepFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn restart_services(&self, services: &[String]) -> Result<(), RevertError> {
        let mut seen = Vec::new();
        for service in services {
            if seen.contains(service) {
                continue;
            }
            seen.push(service.clone());

            let mut attempt = 0;
            loop {
                match self.restarter.restart(service) {
                    RestartOutcome::Ok => {
                        info!(service = %service, "service restarted");
                        break;
                    }
                    RestartOutcome::TransientFailure(reason) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        warn!(
                            service = %service,
                            attempt,
                            reason = %reason,
                            "transient restart failure, retrying"
                        );
                        std::thread::sleep(RETRY_BACKOFF * attempt);
                    }
                    RestartOutcome::TransientFailure(reason) => {
                        return Err(RevertError::ServiceFailed {
                            service: service.clone(),
                            reason: format!("still failing after retries: {reason}"),
                        });
                    }
                    RestartOutcome::UnknownService => {
                        return Err(RevertError::ServiceFailed {
                            service: service.clone(),
                            reason: "unknown service unit".into(),
                        });
                    }
                    RestartOutcome::PermanentFailure(reason) => {
                        return Err(RevertError::ServiceFailed {
                            service: service.clone(),
                            reason,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Full revert for a pending change: plan, suppress, files, services.
    fn revert(
        &mut self,
        snapshot_id: &SnapshotId,
        paths: &[PathBuf],
        services: &[String],
    ) -> Result<(), RevertError> {
        let plan = self.store.restore(snapshot_id, Some(paths))?;
        let plan_paths: Vec<PathBuf> = plan.steps.iter().map(|s| s.path().clone()).collect();

        self.suppressor.suppress(plan_paths.iter());
        let files = self.execute_plan(&plan);
        let outcome = match files {
            Ok(applied) => {
                info!(snapshot = %snapshot_id, files = applied, "files restored");
                self.restart_services(services)
            }
            // Files already written stay; the plan aborts where it failed.
            Err(e) => Err(e),
        };
        self.suppressor.release(plan_paths.iter());
        outcome
    }

    fn self_test(&mut self, watched_paths: usize) -> SelfTestReport {
        let snapshot_roundtrip = self
            .capture(&[], SnapshotOrigin::Manual, Some("self-test".into()))
            .and_then(|(id, _)| {
                self.store.delete(&id)?;
                Ok(())
            })
            .is_ok();
        SelfTestReport {
            root: nix::unistd::geteuid().is_root(),
            distro_family: self.descriptor.distro_family.clone(),
            init_system: self.descriptor.init_system.to_string(),
            init_system_known: self.descriptor.init_system
                != crate::host::InitSystem::Unknown,
            snapshot_store_writable: snapshot_roundtrip,
            ping_available: which_ping(),
            watched_paths,
        }
    }
}

fn which_ping() -> bool {
    std::process::Command::new("ping")
        .arg("-V")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

fn retry_step<F>(path: &PathBuf, mut op: F) -> Result<(), RevertError>
where
    F: FnMut() -> Result<(), RevertError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(path = %path.display(), attempt, "restore step failed, retrying: {e}");
                std::thread::sleep(RETRY_BACKOFF * attempt);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Worker loop. Runs until `Shutdown` or the op channel closes.
pub fn run_worker_loop(
    mut worker: RevertWorker,
    op_rx: Receiver<WorkerOp>,
    result_tx: Sender<WorkerResult>,
) {
    while let Ok(op) = op_rx.recv() {
        match op {
            WorkerOp::CaptureBaseline { category, paths } => {
                let result = worker
                    .capture(&paths, SnapshotOrigin::Auto, Some(format!("{category} baseline")))
                    .map_err(|e| e.to_string());
                if result.is_err() {
                    error!(category = %category, "ALERT: baseline snapshot capture failed");
                }
                let _ = result_tx.send(WorkerResult::BaselineCaptured { category, result });
            }
            WorkerOp::LoadBaseline {
                category,
                snapshot_id,
            } => {
                let result = worker
                    .store
                    .manifest(&snapshot_id)
                    .map(|(manifest, tombstones)| {
                        let mut digests: Vec<(PathBuf, Option<String>)> = manifest
                            .entries
                            .iter()
                            .map(|e| (e.path.clone(), Some(e.digest.clone())))
                            .collect();
                        digests.extend(tombstones.into_iter().map(|p| (p, None)));
                        (snapshot_id.clone(), digests)
                    })
                    .map_err(|e| e.to_string());
                let _ = result_tx.send(WorkerResult::BaselineCaptured { category, result });
            }
            WorkerOp::CaptureManual {
                paths,
                description,
                respond,
            } => {
                let result = worker
                    .capture(&paths, SnapshotOrigin::Manual, description)
                    .map(|(id, _)| id)
                    .map_err(|e| e.to_string());
                let _ = respond.send(result);
            }
            WorkerOp::ListSnapshots { respond } => {
                let _ = respond.send(worker.store.list().map_err(|e| e.to_string()));
            }
            WorkerOp::RestoreSnapshot { id, respond } => {
                let result = worker
                    .store
                    .restore(&id, None)
                    .map_err(RevertError::from)
                    .and_then(|plan| {
                        let paths: Vec<PathBuf> =
                            plan.steps.iter().map(|s| s.path().clone()).collect();
                        worker.suppressor.suppress(paths.iter());
                        let outcome = worker.execute_plan(&plan);
                        worker.suppressor.release(paths.iter());
                        outcome
                    })
                    .map_err(|e| e.to_string());
                let _ = respond.send(result);
            }
            WorkerOp::Probe { id, budget } => {
                let per_endpoint = worker
                    .probe_per_endpoint
                    .min(budget / worker.endpoints.len().max(1) as u32);
                let result = host::reachable(&worker.endpoints, per_endpoint);
                let _ = result_tx.send(WorkerResult::Probed { id, result });
            }
            WorkerOp::Revert {
                id,
                snapshot_id,
                paths,
                services,
            } => {
                let outcome = worker
                    .revert(&snapshot_id, &paths, &services)
                    .map_err(|e| e.to_string());
                let _ = result_tx.send(WorkerResult::RevertDone { id, outcome });
            }
            WorkerOp::SelfTest {
                watched_paths,
                respond,
            } => {
                let _ = respond.send(worker.self_test(watched_paths));
            }
            WorkerOp::Shutdown => break,
        }
    }
    debug!("revert worker stopped");
}
