//! Host probe: distribution detection, service restarts, reachability.
//!
//! Detection runs once at startup and is read-only afterwards. Service
//! restarts and connectivity probes are capability objects built from the
//! detected descriptor; call sites never branch on distro strings.

mod detect;
mod probe;
mod service;

pub use detect::{detect, FirewallSystem, HostDescriptor, InitSystem, NetworkManagerKind};
pub use probe::{reachable, Reachability};
pub use service::{
    default_restart_services, RestartOutcome, ServiceManager, ServiceRestarter,
};
