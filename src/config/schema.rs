use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::paths;

/// Hard ceiling on confirmation timeouts, in seconds.
pub const MAX_TIMEOUT_CEILING: u64 = 1800;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub snapshot: SnapshotConfig,
    /// Category name -> absolute glob patterns, in document order.
    /// The classifier tries categories in this order; first match wins, so
    /// the order administrators write is the order that binds.
    #[serde(with = "ordered_map")]
    pub monitoring: Vec<(String, Vec<String>)>,
    pub timeout: TimeoutConfig,
}

/// The YAML document is a mapping, but a `BTreeMap` would re-sort it
/// alphabetically; this adapter keeps the entries in document order.
mod ordered_map {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(
        entries: &[(String, Vec<String>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (category, globs) in entries {
            map.serialize_entry(category, globs)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, Vec<String>)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<(String, Vec<String>)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of category name to glob list")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((category, globs)) = access.next_entry()? {
                    entries.push((category, globs));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            snapshot: SnapshotConfig::default(),
            monitoring: default_monitoring(),
            timeout: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Confirmation window for categories without their own timeout, seconds.
    pub default_timeout: u64,
    /// Upper bound any per-category timeout is clamped to, seconds.
    pub max_timeout: u64,
    pub log_level: LogLevel,
    /// Control socket location.
    pub socket_path: PathBuf,
    /// Ledger journal directory.
    pub state_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout: 300,
            max_timeout: MAX_TIMEOUT_CEILING,
            log_level: LogLevel::Info,
            socket_path: paths::socket_path(),
            state_dir: paths::state_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// tracing filter directive for this level. CRITICAL has no tracing
    /// counterpart and maps to `error`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Also request a whole-system snapshot from the system tool (timeshift)
    /// when available. File-level snapshots remain the source of truth.
    pub enable_system_tool: bool,
    /// Snapshot store root.
    pub location: PathBuf,
    pub max_snapshots: usize,
    pub max_age_days: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enable_system_tool: false,
            location: paths::snapshot_dir(),
            max_snapshots: 10,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Restore the pre-change snapshot when the window expires.
    Revert,
    /// Log loudly and accept the change as the new baseline.
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub timeout_action: TimeoutAction,
    pub connectivity_check: bool,
    /// Literal IPs or hostnames probed while a change sits in grace.
    pub connectivity_endpoints: Vec<String>,
    /// Per-endpoint probe budget, seconds.
    pub connectivity_timeout: u64,
    /// Window after deadline expiry during which a late confirm still wins,
    /// seconds.
    pub revert_grace_period: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_action: TimeoutAction::Revert,
            connectivity_check: true,
            connectivity_endpoints: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            connectivity_timeout: 10,
            revert_grace_period: 30,
        }
    }
}

impl Config {
    /// Validate the bounds fixed by the external interface contract.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.default_timeout == 0 {
            return Err(ConfigError::Invalid(
                "global.default_timeout must be >= 1".into(),
            ));
        }
        if self.global.max_timeout > MAX_TIMEOUT_CEILING {
            return Err(ConfigError::Invalid(format!(
                "global.max_timeout {} exceeds ceiling {}",
                self.global.max_timeout, MAX_TIMEOUT_CEILING
            )));
        }
        if self.global.default_timeout > self.global.max_timeout {
            return Err(ConfigError::Invalid(format!(
                "global.default_timeout {} exceeds global.max_timeout {}",
                self.global.default_timeout, self.global.max_timeout
            )));
        }
        if self.snapshot.max_snapshots < 1 {
            return Err(ConfigError::Invalid(
                "snapshot.max_snapshots must be >= 1".into(),
            ));
        }
        if self.snapshot.max_age_days < 1 {
            return Err(ConfigError::Invalid(
                "snapshot.max_age_days must be >= 1".into(),
            ));
        }
        if !self.snapshot.location.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "snapshot.location must be absolute, got {}",
                self.snapshot.location.display()
            )));
        }
        let mut seen = BTreeSet::new();
        for (category, patterns) in &self.monitoring {
            if category.is_empty() {
                return Err(ConfigError::Invalid("empty monitoring category".into()));
            }
            if !seen.insert(category) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate monitoring category: {category}"
                )));
            }
            for pattern in patterns {
                if !pattern.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "monitoring.{category} pattern must be absolute: {pattern}"
                    )));
                }
                glob::Pattern::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "monitoring.{category} pattern {pattern}: {e}"
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Confirmation window for a category, in seconds, clamped to
    /// `[1, max_timeout]`.
    pub fn timeout_for(&self, category: &str) -> u64 {
        let raw = match category {
            "network" => 600,
            "ssh" => 900,
            "firewall" | "services" => 300,
            _ => self.global.default_timeout,
        };
        raw.clamp(1, self.global.max_timeout)
    }
}

/// The curated default watch set, recovered from the reference deployment.
/// Order matters: the classifier tries categories as written here.
fn default_monitoring() -> Vec<(String, Vec<String>)> {
    vec![
        (
            "network".into(),
            vec![
                "/etc/network/interfaces".into(),
                "/etc/netplan/*.yaml".into(),
                "/etc/NetworkManager/system-connections/*".into(),
                "/etc/systemd/network/*".into(),
            ],
        ),
        (
            "ssh".into(),
            vec![
                "/etc/ssh/sshd_config".into(),
                "/etc/ssh/sshd_config.d/*".into(),
            ],
        ),
        (
            "firewall".into(),
            vec![
                "/etc/iptables/rules.v4".into(),
                "/etc/iptables/rules.v6".into(),
                "/etc/ufw/*".into(),
                "/etc/firewalld/zones/*".into(),
            ],
        ),
        (
            "services".into(),
            vec!["/etc/systemd/system/*.service".into()],
        ),
        (
            "other".into(),
            vec![
                "/etc/hosts".into(),
                "/etc/resolv.conf".into(),
                "/etc/hostname".into(),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn timeout_bounds_enforced() {
        let mut cfg = Config::default();
        cfg.global.default_timeout = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.global.max_timeout = MAX_TIMEOUT_CEILING + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.global.default_timeout = 600;
        cfg.global.max_timeout = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn category_timeouts_clamped_to_max() {
        let mut cfg = Config::default();
        cfg.global.max_timeout = 400;
        assert_eq!(cfg.timeout_for("ssh"), 400);
        assert_eq!(cfg.timeout_for("firewall"), 300);
        assert_eq!(cfg.timeout_for("other"), 300);
    }

    #[test]
    fn relative_patterns_rejected() {
        let mut cfg = Config::default();
        cfg.monitoring
            .push(("custom".into(), vec!["etc/foo".into()]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_categories_rejected() {
        let mut cfg = Config::default();
        cfg.monitoring
            .push(("ssh".into(), vec!["/etc/ssh/ssh_config".into()]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.global.default_timeout, cfg.global.default_timeout);
        assert_eq!(parsed.timeout.revert_grace_period, 30);
        assert_eq!(parsed.monitoring, cfg.monitoring);
    }

    #[test]
    fn monitoring_document_order_survives_yaml() {
        // "zz_catchall" sorts last but is declared first; the parsed order
        // must be the document's, not alphabetical.
        let yaml = "monitoring:\n  zz_catchall:\n    - /etc/overlap/*\n  aa_specific:\n    - /etc/overlap/file\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&str> = cfg.monitoring.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["zz_catchall", "aa_specific"]);
    }
}
