use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use trainer_core::{
    AudioManager, CaptureConfig, DetectorConfig, DetectorState, HealthEvent, HealthMonitor, HealthMonitorConfig,
    ManualBackend, PitchDetector, TapOptions, TrainerError,
};

fn config(max_recovery_attempts: u32) -> HealthMonitorConfig {
    HealthMonitorConfig {
        enabled: true,
        interval_ms: 20,
        max_recovery_attempts,
        recovery_delay_ms: 10,
    }
}

fn acquired() -> (AudioManager, ManualBackend) {
    let backend = ManualBackend::default();
    let manager = AudioManager::with_default_sensitivity(backend.clone(), CaptureConfig::default(), 1.0);
    manager.acquire().unwrap();
    (manager, backend)
}

fn monitor(manager: &AudioManager, max_recovery_attempts: u32) -> (HealthMonitor, Receiver<HealthEvent>) {
    let (tx, rx) = unbounded();
    let monitor = HealthMonitor::start(manager.clone(), config(max_recovery_attempts), move |event| {
        let _ = tx.send(event.clone());
    })
    .unwrap();
    (monitor, rx)
}

fn wait_for(rx: &Receiver<HealthEvent>, timeout: Duration, mut want: impl FnMut(&HealthEvent) -> bool) -> Vec<HealthEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Ok(event) = rx.recv_deadline(deadline) {
        let done = want(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("expected event never arrived; saw {:?}", seen);
}

#[test]
fn ended_track_is_recovered_without_losing_taps() {
    let (manager, backend) = acquired();
    let tap = manager
        .create_analysis_tap("meter", TapOptions { fft_size: 256, use_filters: false, ..TapOptions::default() })
        .unwrap();
    let (mut monitor, rx) = monitor(&manager, 3);

    backend.feed().unwrap().end_track();
    let events = wait_for(&rx, Duration::from_secs(3), |e| matches!(e, HealthEvent::Recovered { .. }));
    monitor.stop();

    assert!(matches!(events[0], HealthEvent::Unhealthy(ref h) if !h.healthy));
    assert!(events.contains(&HealthEvent::RecoveryStarted { attempt: 1, max_attempts: 3 }));
    assert_eq!(events.last(), Some(&HealthEvent::Recovered { attempt: 1 }));
    assert!(manager.check_health().healthy);
    assert_eq!(manager.ref_count(), 1);
    assert_eq!(backend.open_count(), 2);
    assert!(!tap.is_disposed());

    let stats = monitor.stats();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.failed_recoveries, 0);
    assert!(stats.unhealthy_checks >= 1);
}

#[test]
fn recovery_gives_up_after_the_attempt_budget() {
    let (manager, backend) = acquired();
    let (mut monitor, rx) = monitor(&manager, 2);

    backend.set_permission_denied(true);
    backend.feed().unwrap().end_track();
    let events = wait_for(&rx, Duration::from_secs(3), |e| matches!(e, HealthEvent::GaveUp { .. }));

    let failures: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            HealthEvent::RecoveryFailed { attempt, error } => {
                assert!(matches!(error, TrainerError::DeviceUnavailable(_)));
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![1, 2]);
    assert_eq!(events.last(), Some(&HealthEvent::GaveUp { attempts: 2 }));

    // Quiet after giving up: no further prompts or reports.
    thread::sleep(Duration::from_millis(150));
    monitor.stop();
    assert!(rx.try_recv().is_err());
    assert_eq!(backend.open_count(), 3);
    assert_eq!(monitor.stats().failed_recoveries, 2);
}

#[test]
fn panicking_callback_does_not_stop_monitoring() {
    let (manager, backend) = acquired();
    let mut monitor = HealthMonitor::start(manager.clone(), config(3), |event| {
        if matches!(event, HealthEvent::Unhealthy(_)) {
            panic!("consumer bug");
        }
    })
    .unwrap();

    backend.feed().unwrap().end_track();
    let deadline = Instant::now() + Duration::from_secs(3);
    while !manager.check_health().healthy && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(manager.check_health().healthy);
    assert!(monitor.is_running());
    monitor.stop();
}

#[test]
fn running_detector_resumes_after_recovery() {
    let (manager, backend) = acquired();
    let detector = PitchDetector::new(manager.clone(), DetectorConfig::default()).unwrap();
    detector.initialize().unwrap();
    detector.start_detection().unwrap();
    let (mut monitor, rx) = monitor(&manager, 3);

    backend.feed().unwrap().end_track();
    wait_for(&rx, Duration::from_secs(3), |e| matches!(e, HealthEvent::Recovered { .. }));
    assert_eq!(detector.state(), DetectorState::Detecting);

    let feed = backend.feed().unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut found = false;
    while !found && Instant::now() < deadline {
        feed.push_tone(440.0, 0.5, 2048);
        found = detector.latest_result().is_some_and(|f| f.note == "A4");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(found);

    monitor.stop();
    let taps = detector.tap_ids();
    detector.destroy();
    manager.release(&taps);
}
