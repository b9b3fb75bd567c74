//! Full-daemon test over the control socket: start the daemon against a
//! temporary watch set, edit a watched file, confirm the resulting change,
//! drive the snapshot surface, and shut down cleanly.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use revertit::config::{self, Config};
use revertit::daemon::ipc::{send_request, Request, Response, ResponseValue};
use revertit::snapshot::SnapshotOrigin;

fn test_config(root: &Path) -> (Config, PathBuf) {
    let mut cfg = Config::default();
    cfg.global.socket_path = root.join("ctl.sock");
    cfg.global.state_dir = root.join("state");
    cfg.global.log_level = revertit::config::LogLevel::Warning;
    cfg.snapshot.location = root.join("snapshots");
    cfg.monitoring = vec![("ssh".into(), vec![format!("{}/ssh/*", root.display())])];
    cfg.timeout.connectivity_check = false;
    cfg.timeout.connectivity_endpoints = vec![];

    let path = root.join("config.yaml");
    config::write_config(&path, &cfg).unwrap();
    (cfg, path)
}

fn request_ok(socket: &Path, request: &Request) -> Response {
    let response = send_request(socket, request).expect("daemon reachable");
    assert!(response.ok, "request failed: {:?}", response.error);
    response
}

fn poll<T>(
    deadline: Duration,
    mut attempt: impl FnMut() -> Option<T>,
) -> T {
    let until = Instant::now() + deadline;
    loop {
        if let Some(value) = attempt() {
            return value;
        }
        assert!(Instant::now() < until, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn daemon_end_to_end_over_socket() {
    let dir = tempfile::TempDir::new().unwrap();
    let watch_dir = dir.path().join("ssh");
    fs::create_dir_all(&watch_dir).unwrap();
    let sshd_config = watch_dir.join("sshd_config");
    fs::write(&sshd_config, b"Port 22\n").unwrap();

    let (cfg, cfg_path) = test_config(dir.path());
    let socket = cfg.global.socket_path.clone();

    let daemon = std::thread::spawn(move || {
        revertit::daemon::run_daemon(&cfg_path, false).unwrap();
    });

    // Wait for the control socket and the startup baseline snapshot.
    poll(Duration::from_secs(10), || {
        send_request(&socket, &Request::Status).ok().filter(|r| r.ok)
    });
    poll(Duration::from_secs(10), || {
        let response = request_ok(&socket, &Request::SnapshotsList);
        match response.value {
            Some(ResponseValue::Snapshots { snapshots }) if !snapshots.is_empty() => Some(()),
            _ => None,
        }
    });

    // Status reports a healthy daemon with no pending changes.
    let response = request_ok(&socket, &Request::Status);
    match response.value {
        Some(ResponseValue::Status(info)) => {
            assert!(!info.safe_mode);
            assert_eq!(info.open_changes, 0);
        }
        other => panic!("unexpected status value: {other:?}"),
    }

    // Edit the watched file; the watcher + classifier + ledger open ssh_1.
    // Re-write on each poll attempt in case the first edit raced the
    // baseline landing in the ledger.
    let mut revision = 0u32;
    let change_id = poll(Duration::from_secs(15), || {
        revision += 1;
        fs::write(&sshd_config, format!("Port 22\nMaxAuthTries {revision}\n")).unwrap();
        std::thread::sleep(Duration::from_millis(700));
        let response = request_ok(&socket, &Request::ListChanges { live_only: true });
        match response.value {
            Some(ResponseValue::Changes { changes }) if !changes.is_empty() => {
                Some(changes[0].change_id.clone())
            }
            _ => None,
        }
    });
    assert!(change_id.starts_with("ssh_"));

    // Unknown change: not_found.
    let response = send_request(&socket, &Request::Confirm {
        change_id: "ssh_999".into(),
    })
    .unwrap();
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, "not_found");

    // Confirm the real one.
    let response = request_ok(&socket, &Request::Confirm {
        change_id: change_id.clone(),
    });
    match response.value {
        Some(ResponseValue::ChangeUpdated { state, .. }) => {
            assert_eq!(state, revertit::ledger::ChangeState::Confirmed);
        }
        other => panic!("unexpected confirm value: {other:?}"),
    }

    // Double confirm: not_confirmable.
    let response = send_request(&socket, &Request::Confirm { change_id }).unwrap();
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, "not_confirmable");

    // Manual snapshot via the control surface.
    let response = request_ok(&socket, &Request::SnapshotsCreate {
        description: Some("before maintenance".into()),
    });
    let created = match response.value {
        Some(ResponseValue::SnapshotCreated { snapshot_id }) => snapshot_id,
        other => panic!("unexpected create value: {other:?}"),
    };
    let response = request_ok(&socket, &Request::SnapshotsList);
    match response.value {
        Some(ResponseValue::Snapshots { snapshots }) => {
            let manual = snapshots
                .iter()
                .find(|s| s.id.to_string() == created)
                .expect("created snapshot listed");
            assert_eq!(manual.origin, SnapshotOrigin::Manual);
            assert_eq!(manual.description.as_deref(), Some("before maintenance"));
        }
        other => panic!("unexpected list value: {other:?}"),
    }

    // Self-test over the socket.
    let response = request_ok(&socket, &Request::SelfTest);
    match response.value {
        Some(ResponseValue::SelfTest(report)) => {
            assert!(report.snapshot_store_writable);
        }
        other => panic!("unexpected self-test value: {other:?}"),
    }

    // Clean shutdown via the control surface.
    let response = request_ok(&socket, &Request::Shutdown);
    assert!(matches!(
        response.value,
        Some(ResponseValue::ShuttingDown { .. })
    ));
    daemon.join().unwrap();

    // The journal was compacted on shutdown; the confirmed change survives
    // in the audit window.
    assert!(dir.path().join("state").join("ledger.snapshot.json").exists());
}
