//! Server loops.
//!
//! Three kinds of threads:
//! - the acceptor (run by `run.rs`), which accepts connections and spawns a
//!   handler per client;
//! - handler threads, which authenticate the peer, decode frames, forward
//!   requests to the state thread, and write responses back;
//! - the state thread, THE serialization point: every mutation (control
//!   request, watcher event, timer fire, worker completion) passes through
//!   its `crossbeam::select!` in arrival order.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::core::{Daemon, HandleOutcome};
use super::ipc::{read_request, write_response, IpcError, Request, Response};
use crate::revert::WorkerResult;
use crate::watch::WatchEvent;

pub struct RequestMessage {
    pub request: Request,
    pub respond: Sender<ServerReply>,
}

pub enum ServerReply {
    Response(Response),
    /// The worker owns the answer; the handler thread resolves the thunk.
    Pending(Box<dyn FnOnce() -> Response + Send>),
}

/// Run the state thread until shutdown.
///
/// The tick arm wakes exactly when the earliest timer deadline is due: no
/// polling, no wall-clock arithmetic.
pub fn run_state_loop(
    mut daemon: Daemon,
    req_rx: Receiver<RequestMessage>,
    watch_rx: Receiver<WatchEvent>,
    worker_result_rx: Receiver<WorkerResult>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let tick = match daemon.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                crossbeam::channel::after(wait)
            }
            None => crossbeam::channel::never(),
        };

        crossbeam::select! {
            recv(req_rx) -> msg => {
                let Ok(RequestMessage { request, respond }) = msg else {
                    info!("request channel closed, state thread exiting");
                    daemon.shutdown();
                    shutdown.store(true, Ordering::Relaxed);
                    return;
                };
                match daemon.handle_request(request, Instant::now()) {
                    HandleOutcome::Response(response) => {
                        let _ = respond.send(ServerReply::Response(response));
                    }
                    HandleOutcome::Wait(thunk) => {
                        let _ = respond.send(ServerReply::Pending(thunk));
                    }
                    HandleOutcome::Shutdown(response) => {
                        let _ = respond.send(ServerReply::Response(response));
                        daemon.shutdown();
                        shutdown.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                daemon.tick(Instant::now());
            }

            recv(watch_rx) -> msg => {
                if let Ok(event) = msg {
                    daemon.on_watch_event(event, Instant::now());
                }
                daemon.tick(Instant::now());
            }

            recv(worker_result_rx) -> msg => {
                if let Ok(result) = msg {
                    daemon.on_worker_result(result, Instant::now());
                }
                daemon.tick(Instant::now());
            }

            recv(tick) -> _ => {
                daemon.tick(Instant::now());
            }
        }
    }
}

/// Handle one client connection.
///
/// The peer is authenticated once per connection by its socket credentials:
/// only root (or the uid the daemon itself runs as, for unprivileged test
/// rigs) may speak.
pub fn handle_client(stream: UnixStream, req_tx: Sender<RequestMessage>) {
    let mut stream = stream;

    match peer_allowed(&stream) {
        Ok(true) => {}
        Ok(false) => {
            warn!("rejecting control connection from non-root peer");
            let _ = write_response(
                &mut stream,
                &Response::err("denied", "control socket is root-only"),
            );
            return;
        }
        Err(e) => {
            warn!("failed to read peer credentials: {e}");
            return;
        }
    }

    loop {
        let request = match read_request(&mut stream) {
            Ok(request) => request,
            Err(IpcError::Disconnected) => return,
            Err(e) => {
                debug!("bad control request: {e}");
                let _ = write_response(
                    &mut stream,
                    &Response::err("invalid_request", e.to_string()),
                );
                return;
            }
        };
        let is_shutdown = matches!(request, Request::Shutdown);

        let (respond_tx, respond_rx) = crossbeam::channel::bounded(1);
        if req_tx
            .send(RequestMessage {
                request,
                respond: respond_tx,
            })
            .is_err()
        {
            // State thread is gone.
            let _ = write_response(
                &mut stream,
                &Response::err("internal", "daemon shutting down"),
            );
            return;
        }

        let response = match respond_rx.recv() {
            Ok(ServerReply::Response(response)) => response,
            Ok(ServerReply::Pending(thunk)) => thunk(),
            Err(_) => Response::err("internal", "daemon shutting down"),
        };
        if write_response(&mut stream, &response).is_err() {
            return;
        }
        if is_shutdown {
            return;
        }
    }
}

fn peer_allowed(stream: &UnixStream) -> Result<bool, nix::Error> {
    let creds = nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials)?;
    let uid = creds.uid();
    Ok(uid == 0 || uid == nix::unistd::geteuid().as_raw())
}
