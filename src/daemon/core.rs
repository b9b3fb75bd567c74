//! Daemon core: the state owned by the serialization thread.
//!
//! Owns the ledger, the timeout engine, and the classifier; dispatches
//! control requests; turns ledger effects into timer entries and worker
//! operations. All mutation happens on the state thread that holds this
//! struct.

use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::{debug, error, warn};

use super::ipc::{
    ChangeSummary, Request, Response, ResponseValue, SelfTestReport, StatusInfo,
};
use crate::classify::PathClassifier;
use crate::config::Config;
use crate::host::HostDescriptor;
use crate::ledger::{ChangeId, Effect, Ledger, LedgerError};
use crate::revert::{WorkerOp, WorkerResult};
use crate::snapshot::SnapshotId;
use crate::timer::{DeadlineKind, TimeoutEngine};
use crate::watch::WatchEvent;

/// Retry interval for a timer fire whose journal record could not be
/// written. The transition is gated on the journal, but an unconfirmed
/// change must still revert once the journal recovers.
const JOURNAL_RETRY: Duration = Duration::from_secs(5);

/// How a request leaves the state thread.
pub enum HandleOutcome {
    /// Answer now.
    Response(Response),
    /// The worker owns the answer; the client handler blocks on this thunk
    /// off the state thread.
    Wait(Box<dyn FnOnce() -> Response + Send>),
    /// Answer now, then shut the daemon down.
    Shutdown(Response),
}

pub struct Daemon {
    ledger: Ledger,
    timer: TimeoutEngine,
    classifier: PathClassifier,
    config: Config,
    config_path: std::path::PathBuf,
    descriptor: HostDescriptor,
    worker_tx: Sender<WorkerOp>,
}

impl Daemon {
    pub fn new(
        ledger: Ledger,
        classifier: PathClassifier,
        config: Config,
        config_path: std::path::PathBuf,
        descriptor: HostDescriptor,
        worker_tx: Sender<WorkerOp>,
    ) -> Self {
        Daemon {
            ledger,
            timer: TimeoutEngine::new(),
            classifier,
            config,
            config_path,
            descriptor,
            worker_tx,
        }
    }

    /// Apply the resume effects from ledger replay, then request baselines
    /// for every category that does not have one.
    ///
    /// Categories with live changes keep their pre-change snapshot as the
    /// accepted state (current disk may hold unconfirmed edits); their
    /// digests are reloaded from that snapshot rather than recaptured.
    pub fn bootstrap(&mut self, resume: Vec<Effect>) {
        self.apply_effects(resume);
        let categories: Vec<String> =
            self.classifier.categories().map(str::to_string).collect();
        for category in categories {
            if self.ledger.has_baseline(&category) {
                // Re-established from a resumed change; reload its digests.
                if let Some(change) = self
                    .ledger
                    .list(true)
                    .into_iter()
                    .find(|c| c.category == category)
                {
                    self.send_worker(WorkerOp::LoadBaseline {
                        category,
                        snapshot_id: change.snapshot_id.clone(),
                    });
                }
            } else {
                let paths = self.classifier.expand_existing(&category);
                self.send_worker(WorkerOp::CaptureBaseline { category, paths });
            }
        }
    }

    // === Inputs from the select loop ===

    pub fn on_watch_event(&mut self, event: WatchEvent, now: Instant) {
        match event {
            WatchEvent::Changed { path, digest } => {
                let Some(category) = self.classifier.classify(&path).map(str::to_string) else {
                    debug!(path = %path.display(), "unclassified path, dropping");
                    return;
                };
                match self.ledger.on_change_event(&category, path, digest, now) {
                    Ok(effects) => self.apply_effects(effects),
                    Err(e) => self.journal_failure("recording change event", &e),
                }
            }
            WatchEvent::Degraded { reason } => {
                self.ledger.enter_safe_mode(&reason);
            }
        }
    }

    pub fn on_worker_result(&mut self, result: WorkerResult, _now: Instant) {
        match result {
            WorkerResult::BaselineCaptured { category, result } => match result {
                Ok((snapshot_id, digests)) => {
                    self.ledger.baseline_captured(&category, snapshot_id, digests);
                }
                Err(reason) => {
                    warn!(
                        category = %category,
                        reason = %reason,
                        "baseline capture failed; category unprotected"
                    );
                }
            },
            WorkerResult::Probed { id, result } => {
                self.ledger.probe_observed(&id, result);
            }
            WorkerResult::RevertDone { id, outcome } => {
                // On a journal failure the change stays REVERTING in memory;
                // replay after restart re-runs the idempotent plan.
                match self.ledger.revert_finished(&id, outcome) {
                    Ok(effects) => self.apply_effects(effects),
                    Err(e) => self.journal_failure("recording revert completion", &e),
                }
            }
        }
    }

    /// Fire due timers, run periodic maintenance.
    pub fn tick(&mut self, now: Instant) {
        for fired in self.timer.pop_due(now) {
            let result = match fired.kind {
                DeadlineKind::Deadline => self.ledger.deadline_fired(&fired.change_id, now),
                DeadlineKind::Grace => self.ledger.grace_fired(&fired.change_id),
            };
            match result {
                Ok(effects) => self.apply_effects(effects),
                Err(e) => {
                    self.journal_failure("recording timer fire", &e);
                    // The transition did not happen; retry the fire so the
                    // window still closes once the journal recovers.
                    self.timer
                        .schedule(now + JOURNAL_RETRY, fired.change_id, fired.kind);
                }
            }
        }
        if let Err(e) = self.ledger.purge_expired() {
            self.journal_failure("purging audit window", &e);
        }
        if self.ledger.wants_compaction() {
            if let Err(e) = self.ledger.compact() {
                warn!("journal compaction failed: {e}");
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.next_deadline()
    }

    // === Control surface ===

    pub fn handle_request(&mut self, request: Request, now: Instant) -> HandleOutcome {
        match request {
            Request::Status => HandleOutcome::Response(Response::ok(ResponseValue::Status(
                StatusInfo {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    pid: std::process::id(),
                    safe_mode: self.ledger.is_safe_mode(),
                    open_changes: self.ledger.open_count(),
                    grace_changes: self.ledger.grace_count(),
                    host: self.descriptor.clone(),
                },
            ))),

            Request::ListChanges { live_only } => {
                let changes = self
                    .ledger
                    .list(live_only)
                    .into_iter()
                    .map(|c| ChangeSummary::from_change(c, now))
                    .collect();
                HandleOutcome::Response(Response::ok(ResponseValue::Changes { changes }))
            }

            Request::Confirm { change_id } => {
                let id = ChangeId(change_id);
                match self.ledger.confirm(&id, "cli", now) {
                    Ok(effects) => {
                        self.apply_effects(effects);
                        HandleOutcome::Response(Response::ok(ResponseValue::ChangeUpdated {
                            change_id: id.to_string(),
                            state: crate::ledger::ChangeState::Confirmed,
                        }))
                    }
                    Err(e) => {
                        if matches!(e, LedgerError::Journal { .. }) {
                            self.journal_failure("recording confirm", &e);
                        }
                        HandleOutcome::Response(ledger_error_response(e))
                    }
                }
            }

            Request::Cancel { change_id } => {
                let id = ChangeId(change_id);
                match self.ledger.cancel(&id, "cli") {
                    Ok(effects) => {
                        self.apply_effects(effects);
                        HandleOutcome::Response(Response::ok(ResponseValue::ChangeUpdated {
                            change_id: id.to_string(),
                            state: crate::ledger::ChangeState::Reverting,
                        }))
                    }
                    Err(e) => {
                        if matches!(e, LedgerError::Journal { .. }) {
                            self.journal_failure("recording cancel", &e);
                        }
                        HandleOutcome::Response(ledger_error_response(e))
                    }
                }
            }

            Request::SnapshotsList => {
                let (tx, rx) = crossbeam::channel::bounded(1);
                self.send_worker(WorkerOp::ListSnapshots { respond: tx });
                HandleOutcome::Wait(Box::new(move || match rx.recv() {
                    Ok(Ok(snapshots)) => {
                        Response::ok(ResponseValue::Snapshots { snapshots })
                    }
                    Ok(Err(reason)) => Response::err("internal", reason),
                    Err(_) => Response::err("internal", "worker unavailable"),
                }))
            }

            Request::SnapshotsCreate { description } => {
                let mut paths = Vec::new();
                let categories: Vec<String> =
                    self.classifier.categories().map(str::to_string).collect();
                for category in &categories {
                    paths.extend(self.classifier.expand_existing(category));
                }
                paths.sort();
                paths.dedup();
                let (tx, rx) = crossbeam::channel::bounded(1);
                self.send_worker(WorkerOp::CaptureManual {
                    paths,
                    description,
                    respond: tx,
                });
                HandleOutcome::Wait(Box::new(move || match rx.recv() {
                    Ok(Ok(id)) => Response::ok(ResponseValue::SnapshotCreated {
                        snapshot_id: id.to_string(),
                    }),
                    Ok(Err(reason)) => Response::err("internal", reason),
                    Err(_) => Response::err("internal", "worker unavailable"),
                }))
            }

            Request::SnapshotsRestore { snapshot_id } => {
                let (tx, rx) = crossbeam::channel::bounded(1);
                self.send_worker(WorkerOp::RestoreSnapshot {
                    id: SnapshotId(snapshot_id),
                    respond: tx,
                });
                HandleOutcome::Wait(Box::new(move || match rx.recv() {
                    Ok(Ok(files_restored)) => {
                        Response::ok(ResponseValue::Restored { files_restored })
                    }
                    Ok(Err(reason)) => {
                        if reason.contains("not found") {
                            Response::err("not_found", reason)
                        } else {
                            Response::err("internal", reason)
                        }
                    }
                    Err(_) => Response::err("internal", "worker unavailable"),
                }))
            }

            Request::SelfTest => {
                let watched: usize = self
                    .classifier
                    .categories()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
                    .iter()
                    .map(|c| self.classifier.expand_existing(c).len())
                    .sum();
                let (tx, rx) = crossbeam::channel::bounded(1);
                self.send_worker(WorkerOp::SelfTest {
                    watched_paths: watched,
                    respond: tx,
                });
                HandleOutcome::Wait(Box::new(move || match rx.recv() {
                    Ok(report) => Response::ok(ResponseValue::SelfTest(report)),
                    Err(_) => Response::ok(ResponseValue::SelfTest(SelfTestReport {
                        root: false,
                        distro_family: "unknown".into(),
                        init_system: "unknown".into(),
                        init_system_known: false,
                        snapshot_store_writable: false,
                        ping_available: false,
                        watched_paths: 0,
                    })),
                }))
            }

            Request::ReloadPolicies => match crate::config::load(&self.config_path) {
                Ok(config) => {
                    let policies = super::run::build_policies(&config, &self.descriptor);
                    self.ledger.reload_policies(policies);
                    self.classifier = PathClassifier::new(&config.monitoring);
                    self.config = config;
                    HandleOutcome::Response(Response::ok(ResponseValue::Reloaded {
                        reloaded: true,
                    }))
                }
                Err(e) => {
                    // A broken document on reload keeps the running config.
                    warn!("configuration reload rejected: {e}");
                    HandleOutcome::Response(Response::err("invalid_request", e.to_string()))
                }
            },

            Request::Shutdown => HandleOutcome::Shutdown(Response::ok(
                ResponseValue::ShuttingDown { shutting_down: true },
            )),
        }
    }

    /// Final persistence before exit.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.ledger.compact() {
            warn!("final journal compaction failed: {e}");
        }
        let _ = self.worker_tx.send(WorkerOp::Shutdown);
    }

    // === Effects ===

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ScheduleDeadline { id, due } => {
                    self.timer.schedule(due, id, DeadlineKind::Deadline);
                }
                Effect::ScheduleGrace { id, due } => {
                    self.timer.schedule(due, id, DeadlineKind::Grace);
                }
                Effect::CancelTimers { id } => {
                    self.timer.cancel(&id, DeadlineKind::Deadline);
                    self.timer.cancel(&id, DeadlineKind::Grace);
                }
                Effect::LaunchProbe { id, budget } => {
                    self.send_worker(WorkerOp::Probe { id, budget });
                }
                Effect::StartRevert {
                    id,
                    snapshot_id,
                    paths,
                    services,
                } => {
                    self.send_worker(WorkerOp::Revert {
                        id,
                        snapshot_id,
                        paths,
                        services,
                    });
                }
                Effect::RefreshBaseline { category } => {
                    let paths = self.classifier.expand_existing(&category);
                    self.send_worker(WorkerOp::CaptureBaseline { category, paths });
                }
            }
        }
    }

    fn send_worker(&self, op: WorkerOp) {
        if self.worker_tx.send(op).is_err() {
            warn!("worker channel closed, dropping operation");
        }
    }

    /// A journal write failed: the durable record is the source of truth for
    /// replay, so the daemon can no longer track new changes reliably.
    /// Alert loudly and fail closed.
    fn journal_failure(&mut self, context: &str, e: &LedgerError) {
        error!(context, "ALERT: ledger journal write failed: {e}");
        self.ledger.enter_safe_mode("ledger journal write failure");
    }
}

fn ledger_error_response(e: LedgerError) -> Response {
    match &e {
        LedgerError::NotFound(_) => Response::err("not_found", e.to_string()),
        LedgerError::NotConfirmable { .. } => Response::err("not_confirmable", e.to_string()),
        _ => Response::err("internal", e.to_string()),
    }
}
