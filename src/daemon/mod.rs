//! Daemon: control surface, state thread, and run loop.
//!
//! Provides:
//! - the length-prefixed JSON control protocol over the Unix socket
//! - the state thread that serializes all pending-change mutation
//! - the runner wiring watcher, worker, and acceptor threads together

pub mod core;
pub mod ipc;
pub mod run;
pub mod server;

pub use self::core::{Daemon, HandleOutcome};
pub use ipc::{
    send_request, ChangeSummary, IpcError, Request, Response, ResponseValue, SelfTestReport,
    StatusInfo,
};
pub use run::{build_policies, run_daemon};
pub use server::{handle_client, run_state_loop, RequestMessage, ServerReply};
