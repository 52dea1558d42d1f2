//! Integration tests for the per-device monitor
//!
//! These drive a `Monitor` against the in-memory audio subsystem and check
//! the volumes and handles the subsystem ends up with.

mod common;

use std::thread;
use std::time::Duration;

use common::{approx, backend_with_device, no_delay, wait_until};
use hush_engine::backend::ActivityState;
use hush_engine::backend::memory::SessionSpec;
use hush_engine::monitor::is_device_monitored;
use hush_engine::{
    BackendError, FilterRule, Monitor, MonitorError, MonitorState, Settings, VolumeMode,
};

// ============================================================================
// State Machine
// ============================================================================

#[test]
fn test_start_pause_stop_are_idempotent() {
    let (backend, device) = backend_with_device("idempotent");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    assert_eq!(monitor.status(), MonitorState::Stopped);

    assert_eq!(monitor.start(), MonitorState::Running);
    assert_eq!(monitor.start(), MonitorState::Running);
    assert!(approx(backend.volume(id), 0.5));
    assert_eq!(backend.volume_writes(id), 1);

    assert_eq!(monitor.pause(), MonitorState::Paused);
    assert_eq!(monitor.pause(), MonitorState::Paused);
    assert!(approx(backend.volume(id), 1.0));
    assert_eq!(backend.volume_writes(id), 2);

    assert_eq!(monitor.start(), MonitorState::Running);
    assert_eq!(backend.volume_writes(id), 3);

    assert_eq!(monitor.stop(), MonitorState::Stopped);
    assert_eq!(monitor.stop(), MonitorState::Stopped);
    assert!(approx(backend.volume(id), 1.0));
    assert_eq!(backend.volume_writes(id), 4);
    assert_eq!(backend.open_handles(&device), 0);
    assert!(monitor.sessions().is_empty());
}

#[test]
fn test_pause_from_stopped_is_noop() {
    let (backend, device) = backend_with_device("pause-stopped");
    let monitor = Monitor::new(&backend, &device, no_delay());
    assert_eq!(monitor.pause(), MonitorState::Stopped);
    assert!(!backend.new_session_subscribed(&device));
}

#[test]
fn test_stop_releases_everything() {
    let (backend, device) = backend_with_device("stop-release");
    backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    backend.spawn_session(&device, SessionSpec::new(11, "music.exe"));
    let monitor = Monitor::new(&backend, &device, Settings::default());

    monitor.start();
    assert_eq!(backend.open_handles(&device), 2);
    assert!(backend.new_session_subscribed(&device));

    monitor.stop();
    assert_eq!(backend.open_handles(&device), 0);
    assert_eq!(backend.leaked_handles(), 0);
    assert!(!backend.new_session_subscribed(&device));
}

// ============================================================================
// Delayed Restore
// ============================================================================

#[test]
fn test_duck_then_delayed_restore() {
    let (backend, device) = backend_with_device("scenario");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.8));
    let settings = Settings {
        volume_reduction: 0.5,
        volume_mode: VolumeMode::Percentage,
        restore_delay_ms: 400,
        ..Default::default()
    };
    let monitor = Monitor::new(&backend, &device, settings);

    monitor.start();
    assert!(approx(backend.volume(id), 0.4));

    monitor.pause();
    // still ducked until the delay elapses
    assert!(approx(backend.volume(id), 0.4));
    assert!(monitor.sessions()[0].restore_pending);

    assert!(wait_until(Duration::from_secs(3), || approx(backend.volume(id), 0.8)));
    assert!(!monitor.sessions()[0].restore_pending);
    assert!(monitor.sessions()[0].is_at_default);
}

#[test]
fn test_reapplying_cancels_pending_restore() {
    let (backend, device) = backend_with_device("cancel-restore");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, Settings::default());

    monitor.start();
    monitor.pause();
    assert!(monitor.sessions()[0].restore_pending);

    monitor.start();
    let sessions = monitor.sessions();
    assert_eq!(sessions.iter().filter(|s| s.restore_pending).count(), 0);

    thread::sleep(Duration::from_millis(700));
    assert!(approx(backend.volume(id), 0.5));
    // the second start found the target already applied
    assert_eq!(backend.volume_writes(id), 1);
}

#[test]
fn test_inactive_session_restored_after_delay() {
    let (backend, device) = backend_with_device("inactive");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let settings = Settings {
        restore_delay_ms: 100,
        ..Default::default()
    };
    let monitor = Monitor::new(&backend, &device, settings);
    monitor.start();
    assert!(approx(backend.volume(id), 0.5));

    backend.set_activity(id, ActivityState::Inactive);
    assert!(wait_until(Duration::from_secs(2), || approx(backend.volume(id), 1.0)));

    backend.set_activity(id, ActivityState::Active);
    assert!(wait_until(Duration::from_secs(2), || approx(backend.volume(id), 0.5)));
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn test_inactive_sessions_left_alone() {
    let (backend, device) = backend_with_device("only-active");
    let id = backend.spawn_session(
        &device,
        SessionSpec::new(10, "game.exe").activity(ActivityState::Inactive),
    );
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    assert!(approx(backend.volume(id), 1.0));

    monitor.set_settings(Settings {
        only_active_sessions: false,
        ..no_delay()
    });
    assert!(approx(backend.volume(id), 0.5));
}

#[test]
fn test_default_volume_recovered_from_sibling() {
    let (backend, device) = backend_with_device("recovery");
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();

    let first = backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.8));
    assert_eq!(monitor.sessions().len(), 1);
    assert!(approx(backend.volume(first), 0.4));

    // a relaunch starts at the volume the platform remembered for the group
    let second = backend.spawn_session(&device, SessionSpec::new(11, "game.exe").volume(0.4));
    let sessions = monitor.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(approx(Some(sessions[1].default_volume), 0.8));
    assert!(approx(backend.volume(second), 0.4));

    monitor.stop();
    assert!(approx(backend.volume(first), 0.8));
    assert!(approx(backend.volume(second), 0.8));
}

#[test]
fn test_recovered_default_written_while_paused() {
    let (backend, device) = backend_with_device("recovery-paused");
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();

    let first = backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.8));
    monitor.pause();
    assert!(approx(backend.volume(first), 0.8));

    // nothing is ducked, so the only write is the recovered default
    let second = backend.spawn_session(&device, SessionSpec::new(11, "game.exe").volume(0.4));
    let sessions = monitor.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(approx(Some(sessions[1].default_volume), 0.8));
    assert!(sessions[1].is_at_default);
    assert!(approx(backend.volume(second), 0.8));
    assert_eq!(backend.volume_writes(second), 1);
}

#[test]
fn test_matching_default_needs_no_write() {
    let (backend, device) = backend_with_device("recovery-match");
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.8));
    monitor.pause();

    let second = backend.spawn_session(&device, SessionSpec::new(11, "game.exe").volume(0.8));
    assert_eq!(monitor.sessions().len(), 2);
    assert_eq!(backend.volume_writes(second), 0);
}

#[test]
fn test_refresh_releases_before_enumerating() {
    let (backend, device) = backend_with_device("refresh");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.8));
    backend.spawn_session(&device, SessionSpec::new(11, "music.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());

    monitor.start();
    assert_eq!(monitor.refresh_sessions(), 2);
    assert_eq!(monitor.refresh_sessions(), 2);
    assert_eq!(backend.enumerations_with_open_handles(), 0);
    assert_eq!(backend.open_handles(&device), 2);

    let game = monitor
        .sessions()
        .into_iter()
        .find(|s| s.process_id == 10)
        .unwrap();
    assert!(approx(Some(game.default_volume), 0.8));
    assert!(approx(backend.volume(id), 0.4));
}

#[test]
fn test_refresh_while_stopped_does_nothing() {
    let (backend, device) = backend_with_device("refresh-stopped");
    backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    assert_eq!(monitor.refresh_sessions(), 0);
    assert_eq!(backend.open_handles(&device), 0);
}

#[test]
fn test_external_volume_change_becomes_default() {
    let (backend, device) = backend_with_device("external");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();

    backend.set_volume_externally(id, 0.3);
    let session = &monitor.sessions()[0];
    assert!(approx(Some(session.default_volume), 0.3));
    assert!(session.is_at_default);

    // nothing to restore
    monitor.pause();
    assert!(approx(backend.volume(id), 0.3));

    monitor.start();
    assert!(approx(backend.volume(id), 0.15));
}

#[test]
fn test_own_writes_do_not_move_default() {
    let (backend, device) = backend_with_device("own-writes");
    backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.6));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    monitor.pause();
    monitor.start();
    assert!(approx(Some(monitor.sessions()[0].default_volume), 0.6));
}

#[test]
fn test_new_sessions_while_paused_are_tracked_not_ducked() {
    let (backend, device) = backend_with_device("paused-new");
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    monitor.pause();

    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    assert_eq!(monitor.sessions().len(), 1);
    assert!(approx(backend.volume(id), 1.0));

    monitor.start();
    assert!(approx(backend.volume(id), 0.5));
}

#[test]
fn test_expired_session_removed() {
    let (backend, device) = backend_with_device("expired");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    assert_eq!(backend.open_handles(&device), 1);

    backend.expire_session(id);
    assert!(monitor.sessions().is_empty());
    assert_eq!(backend.open_handles(&device), 0);
}

#[test]
fn test_sweep_expired_inactive_sessions() {
    let (backend, device) = backend_with_device("sweep");
    let quiet = backend.spawn_session(&device, SessionSpec::new(10, "quiet.exe"));
    backend.spawn_session(&device, SessionSpec::new(11, "loud.exe"));
    let settings = Settings {
        session_expiry_secs: 1,
        ..no_delay()
    };
    let monitor = Monitor::new(&backend, &device, settings);
    monitor.start();

    backend.set_activity(quiet, ActivityState::Inactive);
    assert_eq!(monitor.sweep_expired(), 0);

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(monitor.sweep_expired(), 1);
    assert_eq!(monitor.sessions().len(), 1);
    assert!(approx(backend.volume(quiet), 1.0));
}

#[test]
fn test_one_failing_session_does_not_stop_the_rest() {
    let (backend, device) = backend_with_device("isolation");
    let broken = backend.spawn_session(&device, SessionSpec::new(10, "broken.exe"));
    let fine = backend.spawn_session(&device, SessionSpec::new(11, "fine.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());

    monitor.start();
    backend.set_volume_fails(broken, true);
    monitor.pause();
    monitor.start();

    assert_eq!(monitor.status(), MonitorState::Running);
    assert!(approx(backend.volume(fine), 0.5));
    // stuck where the failure left it
    assert!(approx(backend.volume(broken), 0.5));
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn test_set_settings_returns_clamped_values() {
    let (backend, device) = backend_with_device("clamp");
    let monitor = Monitor::new(&backend, &device, no_delay());
    let applied = monitor.set_settings(Settings {
        volume_mode: VolumeMode::Fixed,
        volume_reduction: -0.5,
        restore_delay_ms: -10,
        ..Default::default()
    });
    assert_eq!(applied.volume_reduction, 0.0);
    assert_eq!(applied.restore_delay_ms, 0);
    assert_eq!(monitor.settings(), applied);
    assert_eq!(monitor.volume_reduction(), 0.0);
}

#[test]
fn test_reduction_change_reapplied_while_running() {
    let (backend, device) = backend_with_device("reapply");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();

    monitor.set_settings(Settings {
        volume_reduction: 0.8,
        ..no_delay()
    });
    assert!(approx(backend.volume(id), 0.2));
}

#[test]
fn test_exclusion_filter_round_trip() {
    let (backend, device) = backend_with_device("filter");
    let game = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let music = backend.spawn_session(&device, SessionSpec::new(11, "music.exe"));
    let mut settings = Settings {
        included_filter: vec![FilterRule::Name("music".to_string())],
        excluded_filter: vec![FilterRule::Name("music".to_string())],
        ..no_delay()
    };
    let monitor = Monitor::new(&backend, &device, settings.clone());
    monitor.start();
    assert!(approx(backend.volume(game), 0.5));
    assert!(approx(backend.volume(music), 1.0));

    for use_included in [true, false, true] {
        settings.use_included_filter = use_included;
        monitor.set_settings(settings.clone());

        for session in monitor.sessions() {
            assert!(!(session.excluded && !session.is_at_default));
        }
    }

    // include list in effect: only music is ducked
    assert!(approx(backend.volume(game), 1.0));
    assert!(approx(backend.volume(music), 0.5));
}

#[test]
fn test_name_rule_matches_display_name() {
    let (backend, device) = backend_with_device("filter-display");
    let chat = backend.spawn_session(
        &device,
        SessionSpec::new(10, "app-1234.exe").display_name("Team Chat"),
    );
    let game = backend.spawn_session(&device, SessionSpec::new(11, "game.exe"));
    let settings = Settings {
        excluded_filter: vec![FilterRule::Name("team chat".to_string())],
        ..no_delay()
    };
    let monitor = Monitor::new(&backend, &device, settings);
    monitor.start();

    assert!(approx(backend.volume(chat), 1.0));
    assert!(approx(backend.volume(game), 0.5));
    let excluded: Vec<_> = monitor
        .sessions()
        .into_iter()
        .filter(|s| s.excluded)
        .map(|s| s.display_name)
        .collect();
    assert_eq!(excluded, vec!["Team Chat".to_string()]);
}

#[test]
fn test_excluding_by_pid() {
    let (backend, device) = backend_with_device("filter-pid");
    let game = backend.spawn_session(&device, SessionSpec::new(10, "game.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();

    monitor.set_settings(Settings {
        excluded_filter: vec![FilterRule::ProcessId(10)],
        ..no_delay()
    });
    assert!(approx(backend.volume(game), 1.0));
    assert!(monitor.sessions()[0].excluded);
}

#[test]
fn test_own_process_never_ducked() {
    let (backend, device) = backend_with_device("own-process");
    let own = backend.spawn_session(&device, SessionSpec::new(std::process::id(), "us.exe"));
    let monitor = Monitor::new(&backend, &device, no_delay());
    monitor.start();
    assert!(approx(backend.volume(own), 1.0));
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_unknown_device_is_init_error() {
    let (backend, _device) = backend_with_device("unknown");
    let monitor = Monitor::new(&backend, "no-such-device", no_delay());

    assert_eq!(monitor.status(), MonitorState::InitError);
    assert_eq!(monitor.start(), MonitorState::InitError);
    assert_eq!(
        monitor.init_error(),
        Some(&MonitorError::DeviceNotFound("no-such-device".to_string()))
    );
    assert!(monitor.sessions().is_empty());
}

#[test]
fn test_device_monitored_twice_is_init_error() {
    let (backend, device) = backend_with_device("twice");
    let first = Monitor::new(&backend, &device, no_delay());
    assert!(first.init_error().is_none());
    assert!(is_device_monitored(&device));

    let second = Monitor::new(&backend, &device, no_delay());
    assert_eq!(
        second.init_error(),
        Some(&MonitorError::DeviceAlreadyInUse(device.clone()))
    );
    assert_eq!(second.pause(), MonitorState::InitError);

    drop(first);
    assert!(!is_device_monitored(&device));
    let third = Monitor::new(&backend, &device, no_delay());
    assert_eq!(third.status(), MonitorState::Stopped);
}

#[test]
fn test_failed_open_is_init_error() {
    let (backend, device) = backend_with_device("open-fails");
    backend.fail_device(&device);
    let monitor = Monitor::new(&backend, &device, no_delay());
    assert!(matches!(
        monitor.init_error(),
        Some(MonitorError::Backend(BackendError::Native { .. }))
    ));
    // the claim is not kept by a failed monitor
    assert!(!is_device_monitored(&device));
}

#[test]
fn test_empty_id_means_default_device() {
    let (backend, device) = backend_with_device("default");
    let monitor = Monitor::new(&backend, "", no_delay());
    assert_eq!(monitor.device_id(), Some(device.as_str()));
    assert_eq!(monitor.device_name(), Some("Speakers"));
    assert_eq!(monitor.requested_device_id(), "");
}

#[test]
fn test_drop_restores_volumes() {
    let (backend, device) = backend_with_device("drop");
    let id = backend.spawn_session(&device, SessionSpec::new(10, "game.exe").volume(0.9));
    let monitor = Monitor::new(&backend, &device, Settings::default());
    monitor.start();
    assert!(approx(backend.volume(id), 0.45));

    drop(monitor);
    assert!(approx(backend.volume(id), 0.9));
    assert_eq!(backend.open_handles(&device), 0);
    assert!(!is_device_monitored(&device));
}
