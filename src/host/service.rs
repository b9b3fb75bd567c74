//! Service restart primitive.
//!
//! A `ServiceManager` is built once from the detected init system; the revert
//! engine only ever sees the `ServiceRestarter` trait, which keeps the seam
//! fakeable in tests.

use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::detect::InitSystem;
use crate::Transience;

/// Outcome of one restart attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    Ok,
    /// The init system does not know the unit. Retrying cannot help.
    UnknownService,
    /// Timed out or failed with a retryable exit status.
    TransientFailure(String),
    /// Restart command missing or structurally unable to run.
    PermanentFailure(String),
}

impl RestartOutcome {
    pub fn transience(&self) -> Transience {
        match self {
            RestartOutcome::Ok => Transience::Permanent,
            RestartOutcome::TransientFailure(_) => Transience::Retryable,
            RestartOutcome::UnknownService | RestartOutcome::PermanentFailure(_) => {
                Transience::Permanent
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RestartOutcome::Ok)
    }
}

/// Seam between the revert engine and the init system.
pub trait ServiceRestarter: Send {
    fn restart(&self, service: &str) -> RestartOutcome;
}

/// Restarts services through the detected init system.
pub struct ServiceManager {
    init: InitSystem,
    command_timeout: Duration,
}

impl ServiceManager {
    pub fn new(init: InitSystem) -> Self {
        Self {
            init,
            command_timeout: Duration::from_secs(30),
        }
    }

    fn command_for(&self, service: &str) -> Option<Command> {
        let mut cmd = match self.init {
            InitSystem::Systemd => {
                let mut c = Command::new("systemctl");
                c.arg("restart").arg(service);
                c
            }
            InitSystem::SysV => {
                let mut c = Command::new("service");
                c.arg(service).arg("restart");
                c
            }
            InitSystem::OpenRc => {
                let mut c = Command::new("rc-service");
                c.arg(service).arg("restart");
                c
            }
            InitSystem::Unknown => return None,
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
        Some(cmd)
    }
}

impl ServiceRestarter for ServiceManager {
    fn restart(&self, service: &str) -> RestartOutcome {
        let Some(mut cmd) = self.command_for(service) else {
            return RestartOutcome::PermanentFailure("no known init system".into());
        };

        debug!(service, init = %self.init, "restarting service");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RestartOutcome::PermanentFailure(format!(
                    "restart command not found: {e}"
                ));
            }
            Err(e) => return RestartOutcome::TransientFailure(e.to_string()),
        };

        match wait_with_timeout(&mut child, self.command_timeout) {
            WaitResult::Exited(status) if status.success() => RestartOutcome::Ok,
            WaitResult::Exited(status) => {
                let stderr = child
                    .stderr
                    .take()
                    .and_then(|mut s| {
                        use std::io::Read;
                        let mut buf = String::new();
                        s.read_to_string(&mut buf).ok().map(|_| buf)
                    })
                    .unwrap_or_default();
                classify_exit(service, status.code(), &stderr)
            }
            WaitResult::TimedOut => {
                warn!(service, "service restart timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                RestartOutcome::TransientFailure("restart timed out".into())
            }
            WaitResult::WaitFailed(e) => RestartOutcome::TransientFailure(e.to_string()),
        }
    }
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Duration) -> WaitResult {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitResult::Exited(status),
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    return WaitResult::TimedOut;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return WaitResult::WaitFailed(e),
        }
    }
}

fn classify_exit(service: &str, code: Option<i32>, stderr: &str) -> RestartOutcome {
    // systemctl exits 5 for an unknown unit; the message check catches the
    // sysv/openrc equivalents.
    let unknown_unit = code == Some(5)
        || stderr.contains("not found")
        || stderr.contains("could not be found")
        || stderr.contains("unrecognized service");
    if unknown_unit {
        debug!(service, ?code, "unknown service unit");
        RestartOutcome::UnknownService
    } else {
        RestartOutcome::TransientFailure(format!(
            "exit {:?}: {}",
            code,
            stderr.trim()
        ))
    }
}

/// Ordered restart lists per category, derived from the host capabilities.
///
/// Returned lists follow the revert rule of thumb: the narrowest service
/// that reloads the reverted files.
pub fn default_restart_services(
    category: &str,
    desc: &super::HostDescriptor,
) -> Vec<String> {
    use super::detect::{FirewallSystem, NetworkManagerKind};
    match category {
        "network" => match desc.network_manager {
            NetworkManagerKind::NetworkManager => vec!["NetworkManager".into()],
            NetworkManagerKind::SystemdNetworkd => vec!["systemd-networkd".into()],
            NetworkManagerKind::Netplan | NetworkManagerKind::Ifupdown => {
                vec!["networking".into()]
            }
            NetworkManagerKind::Unknown => vec![],
        },
        "ssh" => vec!["sshd".into()],
        "firewall" => match desc.firewall_system {
            FirewallSystem::Ufw => vec!["ufw".into()],
            FirewallSystem::Firewalld => vec!["firewalld".into()],
            FirewallSystem::Iptables | FirewallSystem::Nftables => vec!["netfilter-persistent".into()],
            FirewallSystem::Unknown => vec![],
        },
        // Unit file edits only need the manager to re-read its state; the
        // affected unit itself was not necessarily running.
        "services" => vec![],
        _ => vec![],
    }
}
