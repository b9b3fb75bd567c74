//! Human-oriented output tables.

use time::format_description;
use time::OffsetDateTime;

use crate::daemon::ipc::{ChangeSummary, StatusInfo};
use crate::snapshot::SnapshotMeta;

pub fn print_status(info: &StatusInfo) {
    println!("revertit {} (pid {})", info.version, info.pid);
    if info.safe_mode {
        println!("state:     SAFE-MODE (watcher degraded; new changes refused)");
    } else {
        println!("state:     monitoring");
    }
    println!(
        "host:      {} {} / {} / {}",
        info.host.distro_family,
        info.host.distro_version,
        info.host.init_system,
        info.host.package_manager
    );
    println!(
        "changes:   {} open, {} in grace",
        info.open_changes, info.grace_changes
    );
}

pub fn print_changes(changes: &[ChangeSummary]) {
    if changes.is_empty() {
        println!("no pending changes");
        return;
    }
    println!(
        "{:<16} {:<10} {:<10} {:>10}  PATHS",
        "CHANGE", "CATEGORY", "STATE", "REMAINING"
    );
    for change in changes {
        let remaining = match change.grace_remaining_secs {
            Some(grace) => format!("{grace}s grace"),
            None => format!("{}s", change.remaining_secs),
        };
        println!(
            "{:<16} {:<10} {:<10} {:>10}  {}",
            change.change_id,
            change.category,
            change.state,
            remaining,
            change.paths.join(", ")
        );
    }
}

pub fn print_snapshots(snapshots: &[SnapshotMeta]) {
    if snapshots.is_empty() {
        println!("no snapshots");
        return;
    }
    println!(
        "{:<16} {:<8} {:<22} {:>6}  DESCRIPTION",
        "SNAPSHOT", "ORIGIN", "CREATED", "FILES"
    );
    for meta in snapshots {
        let origin = match meta.origin {
            crate::snapshot::SnapshotOrigin::Auto => "auto",
            crate::snapshot::SnapshotOrigin::Manual => "manual",
        };
        println!(
            "{:<16} {:<8} {:<22} {:>6}  {}",
            meta.id,
            origin,
            format_epoch_ms(meta.created_at_wall_ms),
            meta.entry_count,
            meta.description.as_deref().unwrap_or("-")
        );
    }
}

/// Render epoch milliseconds as UTC `YYYY-MM-DD HH:MM:SS`.
fn format_epoch_ms(ms: u64) -> String {
    let format = match format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second]",
    ) {
        Ok(format) => format,
        Err(_) => return "-".into(),
    };
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|when| when.format(&format).ok())
        .unwrap_or_else(|| "-".into())
}
