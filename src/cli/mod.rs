//! Command-line front-end.
//!
//! Thin handlers over the daemon control socket. Exit codes are part of the
//! interface contract:
//! - `status`: 0 when the daemon is reachable, 2 otherwise
//! - `confirm`/`cancel`: 0 on success, 3 when the change is unknown, 4 when
//!   it is not confirmable
//! - `test`: 0 when all required capabilities are present

mod render;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config;
use crate::daemon::ipc::{send_request, Request, Response, ResponseValue};
use crate::paths;

#[derive(Parser, Debug)]
#[command(
    name = "revertit",
    version,
    about = "Timed-confirmation safety net for Linux configuration changes",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Configuration file path.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Control socket path (default: from configuration).
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show daemon status.
    Status,

    /// List open and grace-state changes awaiting confirmation.
    Timeouts,

    /// Confirm a pending configuration change.
    Confirm { change_id: String },

    /// Cancel a pending change: revert it immediately.
    Cancel { change_id: String },

    /// Manage snapshots.
    Snapshots(SnapshotsArgs),

    /// Run the capability self-test; prints a JSON report.
    Test,

    /// Daemon management.
    Daemon(DaemonArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub action: SnapshotsAction,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotsAction {
    /// List snapshots, newest first.
    List,
    /// Capture a manual snapshot of every watched path.
    Create {
        #[arg(long)]
        description: Option<String>,
    },
    /// Restore every file recorded in a snapshot. Services are not
    /// restarted; do that manually if needed.
    Restore { snapshot_id: String },
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub action: DaemonAction,
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Run the daemon in the foreground.
    Run {
        /// Discard an inconsistent ledger journal instead of refusing to
        /// start.
        #[arg(long)]
        force_reset: bool,
    },
}

/// Execute the parsed command line; returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(paths::config_path);

    if let Commands::Daemon(args) = &cli.command {
        let DaemonAction::Run { force_reset } = &args.action;
        return match crate::daemon::run_daemon(&config_path, *force_reset) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("daemon failed: {e}");
                1
            }
        };
    }

    let socket = cli.socket.clone().unwrap_or_else(|| {
        config::load(&config_path)
            .map(|c| c.global.socket_path)
            .unwrap_or_else(|_| paths::socket_path())
    });

    let request = match &cli.command {
        Commands::Status => Request::Status,
        Commands::Timeouts => Request::ListChanges { live_only: true },
        Commands::Confirm { change_id } => Request::Confirm {
            change_id: change_id.clone(),
        },
        Commands::Cancel { change_id } => Request::Cancel {
            change_id: change_id.clone(),
        },
        Commands::Snapshots(args) => match &args.action {
            SnapshotsAction::List => Request::SnapshotsList,
            SnapshotsAction::Create { description } => Request::SnapshotsCreate {
                description: description.clone(),
            },
            SnapshotsAction::Restore { snapshot_id } => Request::SnapshotsRestore {
                snapshot_id: snapshot_id.clone(),
            },
        },
        Commands::Test => Request::SelfTest,
        Commands::Daemon(_) => unreachable!("handled above"),
    };

    let response = match send_request(&socket, &request) {
        Ok(response) => response,
        Err(e) => {
            eprintln!("cannot reach daemon: {e}");
            return 2;
        }
    };

    render_response(&cli.command, response)
}

fn render_response(command: &Commands, response: Response) -> i32 {
    if !response.ok {
        let error = response
            .error
            .unwrap_or_else(|| crate::daemon::ipc::ErrorPayload {
                code: "internal".into(),
                message: "malformed response".into(),
            });
        eprintln!("error: {}", error.message);
        return match (command, error.code.as_str()) {
            (Commands::Confirm { .. } | Commands::Cancel { .. }, "not_found") => 3,
            (Commands::Confirm { .. } | Commands::Cancel { .. }, "not_confirmable") => 4,
            _ => 1,
        };
    }

    match response.value {
        Some(ResponseValue::Status(info)) => {
            render::print_status(&info);
            0
        }
        Some(ResponseValue::Changes { changes }) => {
            render::print_changes(&changes);
            0
        }
        Some(ResponseValue::ChangeUpdated { change_id, state }) => {
            println!("{change_id}: {state}");
            0
        }
        Some(ResponseValue::Snapshots { snapshots }) => {
            render::print_snapshots(&snapshots);
            0
        }
        Some(ResponseValue::SnapshotCreated { snapshot_id }) => {
            println!("created snapshot {snapshot_id}");
            0
        }
        Some(ResponseValue::Restored { files_restored }) => {
            println!("restored {files_restored} files");
            println!("restart affected services manually if required");
            0
        }
        Some(ResponseValue::SelfTest(report)) => {
            // Machine-readable contract: the report goes to stdout as JSON.
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("failed to render report: {e}");
                    return 1;
                }
            }
            if report.required_ok() {
                0
            } else {
                1
            }
        }
        Some(ResponseValue::Reloaded { .. }) | Some(ResponseValue::ShuttingDown { .. }) => 0,
        None => {
            eprintln!("error: empty response");
            1
        }
    }
}
