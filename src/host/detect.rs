//! Distribution and subsystem detection.
//!
//! Reads `/etc/os-release` (with the `/usr/lib` fallback) and checks for
//! well-known paths and binaries. Deterministic and side-effect-free.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSystem {
    Systemd,
    SysV,
    OpenRc,
    Unknown,
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitSystem::Systemd => "systemd",
            InitSystem::SysV => "sysv",
            InitSystem::OpenRc => "openrc",
            InitSystem::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkManagerKind {
    Netplan,
    NetworkManager,
    SystemdNetworkd,
    Ifupdown,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallSystem {
    Ufw,
    Firewalld,
    Iptables,
    Nftables,
    Unknown,
}

/// What the daemon learned about the host at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub distro_family: String,
    pub distro_version: String,
    pub init_system: InitSystem,
    pub network_manager: NetworkManagerKind,
    pub firewall_system: FirewallSystem,
    pub package_manager: String,
}

/// Detect the host environment from the live filesystem.
pub fn detect() -> HostDescriptor {
    detect_at(Path::new("/"))
}

/// Detection against an alternate root, for tests.
pub fn detect_at(root: &Path) -> HostDescriptor {
    let os_release = read_os_release(root);
    let id = os_release.get("ID").cloned().unwrap_or_default();
    let id_like = os_release.get("ID_LIKE").cloned().unwrap_or_default();

    HostDescriptor {
        distro_family: family_of(&id_like, &id),
        distro_version: os_release
            .get("VERSION_ID")
            .cloned()
            .unwrap_or_else(|| "unknown".into()),
        init_system: init_system_at(root),
        network_manager: network_manager_at(root),
        firewall_system: firewall_at(root),
        package_manager: package_manager_of(&id, root),
    }
}

fn read_os_release(root: &Path) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for candidate in ["etc/os-release", "usr/lib/os-release"] {
        let path = root.join(candidate);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
                );
            }
        }
        if !fields.is_empty() {
            break;
        }
    }
    fields
}

fn family_of(id_like: &str, id: &str) -> String {
    let id_like = id_like.to_ascii_lowercase();
    let id = id.to_ascii_lowercase();

    for family in ["debian", "rhel", "fedora", "arch", "suse", "alpine"] {
        if id_like.contains(family) {
            return normalize_family(family).into();
        }
    }
    match id.as_str() {
        "ubuntu" | "debian" | "mint" | "elementary" => "debian".into(),
        "rhel" | "centos" | "fedora" | "rocky" | "alma" => "rhel".into(),
        "arch" | "manjaro" => "arch".into(),
        "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => "suse".into(),
        "gentoo" => "gentoo".into(),
        "alpine" => "alpine".into(),
        "" => "unknown".into(),
        other => other.into(),
    }
}

fn normalize_family(family: &str) -> &str {
    match family {
        "fedora" => "rhel",
        other => other,
    }
}

fn init_system_at(root: &Path) -> InitSystem {
    if root.join("run/systemd/system").is_dir() {
        InitSystem::Systemd
    } else if root.join("etc/runlevels").is_dir() {
        InitSystem::OpenRc
    } else if root.join("etc/init.d").is_dir() {
        InitSystem::SysV
    } else {
        InitSystem::Unknown
    }
}

fn network_manager_at(root: &Path) -> NetworkManagerKind {
    if root.join("etc/netplan").is_dir() {
        NetworkManagerKind::Netplan
    } else if root.join("etc/NetworkManager").is_dir() {
        NetworkManagerKind::NetworkManager
    } else if root.join("etc/systemd/network").is_dir() {
        NetworkManagerKind::SystemdNetworkd
    } else if root.join("etc/network/interfaces").is_file() {
        NetworkManagerKind::Ifupdown
    } else {
        NetworkManagerKind::Unknown
    }
}

fn firewall_at(root: &Path) -> FirewallSystem {
    if has_binary(root, "ufw") || root.join("etc/ufw").is_dir() {
        FirewallSystem::Ufw
    } else if has_binary(root, "firewall-cmd") || root.join("etc/firewalld").is_dir() {
        FirewallSystem::Firewalld
    } else if has_binary(root, "nft") {
        FirewallSystem::Nftables
    } else if has_binary(root, "iptables") {
        FirewallSystem::Iptables
    } else {
        FirewallSystem::Unknown
    }
}

fn package_manager_of(id: &str, root: &Path) -> String {
    let by_id = match id.to_ascii_lowercase().as_str() {
        "ubuntu" | "debian" | "mint" | "elementary" => Some("apt"),
        "rhel" | "centos" | "rocky" | "alma" => Some("yum"),
        "fedora" => Some("dnf"),
        "arch" | "manjaro" => Some("pacman"),
        "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => Some("zypper"),
        "alpine" => Some("apk"),
        "gentoo" => Some("emerge"),
        _ => None,
    };
    if let Some(pm) = by_id {
        return pm.into();
    }
    // Fall back to probing for the binary itself.
    for pm in ["apt", "dnf", "yum", "pacman", "zypper", "apk", "emerge"] {
        if has_binary(root, pm) {
            return pm.into();
        }
    }
    "unknown".into()
}

/// Binary presence check over the usual sbin/bin locations.
pub(crate) fn has_binary(root: &Path, name: &str) -> bool {
    ["usr/sbin", "usr/bin", "sbin", "bin", "usr/local/bin", "usr/local/sbin"]
        .iter()
        .any(|dir| root.join(dir).join(name).is_file())
}
