use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use trainer_core::{AudioManager, CaptureConfig, GraphState, ManualBackend, TapOptions, TrainerError};

fn manager() -> (AudioManager, ManualBackend) {
    let backend = ManualBackend::default();
    let manager = AudioManager::with_default_sensitivity(backend.clone(), CaptureConfig::default(), 1.0);
    (manager, backend)
}

fn small_tap() -> TapOptions {
    TapOptions {
        fft_size: 512,
        use_filters: false,
        ..TapOptions::default()
    }
}

#[test]
fn concurrent_acquires_share_one_permission_prompt() {
    let (manager, backend) = manager();
    backend.set_open_delay(Duration::from_millis(100));

    let (tx, rx) = unbounded();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let tx = tx.clone();
            thread::spawn(move || tx.send(manager.acquire()).unwrap())
        })
        .collect();
    drop(tx);
    for worker in workers {
        worker.join().unwrap();
    }

    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.open_count(), 1);
    assert_eq!(manager.ref_count(), 8);
    assert_eq!(manager.state(), GraphState::Ready);

    for _ in 0..7 {
        manager.release::<&str>(&[]);
        assert_eq!(backend.close_count(), 0);
    }
    manager.release::<&str>(&[]);
    assert_eq!(backend.close_count(), 1);
    assert_eq!(manager.state(), GraphState::Uninitialized);

    // A surplus release must not underflow or reopen anything.
    manager.release::<&str>(&[]);
    assert_eq!(manager.ref_count(), 0);
    assert_eq!(backend.open_count(), 1);
}

#[test]
fn waiters_share_a_failed_attempt() {
    let (manager, backend) = manager();
    backend.set_open_delay(Duration::from_millis(100));
    backend.set_permission_denied(true);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire())
        })
        .collect();
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, TrainerError::DeviceUnavailable(_)));
    }
    assert_eq!(backend.open_count(), 1);
    assert_eq!(manager.ref_count(), 0);
}

#[test]
fn denied_permission_can_be_retried() {
    let (manager, backend) = manager();
    backend.set_permission_denied(true);

    let err = manager.acquire().unwrap_err();
    assert!(matches!(err, TrainerError::DeviceUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(manager.state(), GraphState::Error);
    assert!(manager.status().last_error.is_some());

    backend.set_permission_denied(false);
    manager.acquire().unwrap();
    assert_eq!(manager.state(), GraphState::Ready);
    assert_eq!(backend.open_count(), 2);
    assert!(manager.status().last_error.is_none());
}

#[test]
fn platform_failure_maps_to_init_failed() {
    let (manager, backend) = manager();
    backend.fail_next_open("driver exploded");
    let err = manager.acquire().unwrap_err();
    assert!(matches!(err, TrainerError::DeviceInitFailed(_)));
    manager.acquire().unwrap();
}

#[test]
fn duplicate_tap_ids_are_rejected() {
    let (manager, _) = manager();
    manager.acquire().unwrap();
    manager.create_analysis_tap("meter", small_tap()).unwrap();
    let err = manager.create_analysis_tap("meter", small_tap()).unwrap_err();
    assert_eq!(err, TrainerError::DuplicateTapId("meter".into()));

    manager.remove_tap("meter");
    manager.create_analysis_tap("meter", small_tap()).unwrap();
}

#[test]
fn sensitivity_is_clamped_and_restored_on_teardown() {
    let (manager, _) = manager();
    assert_eq!(manager.set_sensitivity(15.0), 10.0);
    assert_eq!(manager.set_sensitivity(-1.0), 0.1);
    assert_eq!(manager.set_sensitivity(f32::NAN), 0.1);

    manager.acquire().unwrap();
    manager.set_sensitivity(3.0);
    manager.release::<&str>(&[]);
    assert_eq!(manager.sensitivity(), manager.default_sensitivity());
}

#[test]
fn ended_track_is_reopened_on_next_acquire() {
    let (manager, backend) = manager();
    manager.acquire().unwrap();
    let tap = manager.create_analysis_tap("old", small_tap()).unwrap();

    backend.feed().unwrap().end_track();
    assert!(!manager.check_health().healthy);

    manager.acquire().unwrap();
    assert!(manager.check_health().healthy);
    assert_eq!(backend.open_count(), 2);
    assert_eq!(backend.close_count(), 1);
    // Taps of the old graph are invalidated.
    assert!(tap.is_disposed());
}

#[test]
fn status_lists_taps_and_force_cleanup_resets() {
    let (manager, backend) = manager();
    manager.acquire().unwrap();
    manager.acquire().unwrap();
    manager.create_analysis_tap("raw", small_tap()).unwrap();
    manager
        .create_analysis_tap(
            "filtered",
            TapOptions {
                use_filters: true,
                ..small_tap()
            },
        )
        .unwrap();

    let status = manager.status();
    assert_eq!(status.tap_ids, vec!["filtered".to_string(), "raw".to_string()]);
    assert_eq!(status.filtered_tap_ids, vec!["filtered".to_string()]);
    assert_eq!(status.sample_rate, Some(44100));
    assert_eq!(manager.check_health().tap_count, 2);

    manager.force_cleanup();
    assert_eq!(manager.state(), GraphState::Uninitialized);
    assert_eq!(manager.ref_count(), 0);
    assert_eq!(backend.close_count(), 1);
    assert!(manager.status().tap_ids.is_empty());
}
