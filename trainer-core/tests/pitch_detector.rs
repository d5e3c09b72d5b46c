use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use trainer_core::{
    AudioManager, CaptureConfig, DetectorConfig, DetectorState, FrameStatus, ManualBackend, PitchDetector,
    SilenceConfig, SilenceEvent, TrainerError,
};

const FRAME: usize = 8192;

struct Rig {
    manager: AudioManager,
    backend: ManualBackend,
    detector: PitchDetector,
}

fn rig_with(config: DetectorConfig) -> Rig {
    let backend = ManualBackend::default();
    let manager = AudioManager::with_default_sensitivity(backend.clone(), CaptureConfig::default(), 1.0);
    manager.acquire().unwrap();
    let detector = PitchDetector::new(manager.clone(), config).unwrap();
    detector.initialize().unwrap();
    Rig {
        manager,
        backend,
        detector,
    }
}

fn rig() -> Rig {
    rig_with(DetectorConfig::default())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn middle_c_is_detected_in_tune() {
    let rig = rig();
    rig.backend.feed().unwrap().push_tone(261.63, 0.5, FRAME);

    let frame = rig.detector.analyze_now().unwrap().unwrap();
    assert_eq!(frame.status, FrameStatus::Pitched);
    assert_eq!(frame.note, "C4");
    assert_eq!(frame.octave, Some(4));
    assert!(frame.clarity > 0.85, "clarity {}", frame.clarity);
    assert_abs_diff_eq!(frame.frequency, 261.63, epsilon = 1.5);
    assert!(frame.cents.unwrap().abs() < 10.0);
    assert!(!frame.harmonic_corrected);
}

#[test]
fn silence_yields_no_pitch() {
    let rig = rig();
    rig.backend.feed().unwrap().push_silence(FRAME);

    let frame = rig.detector.analyze_now().unwrap().unwrap();
    assert_eq!(frame.status, FrameStatus::Silent);
    assert_eq!(frame.frequency, 0.0);
    assert_eq!(frame.clarity, 0.0);
    assert_eq!(frame.note, "--");
    assert_eq!(frame.cents, None);
}

#[test]
fn clean_tone_below_volume_floor_reports_no_pitch() {
    let rig = rig_with(DetectorConfig {
        volume_smoothing: 1.0,
        ..DetectorConfig::default()
    });
    let feed = rig.backend.feed().unwrap();
    for _ in 0..3 {
        // RMS of a 0.02 sine is ~0.014, under the 0.02 floor.
        feed.push_tone(261.63, 0.02, FRAME);
        let frame = rig.detector.analyze_now().unwrap().unwrap();
        assert_eq!(frame.status, FrameStatus::Silent);
        assert_eq!(frame.frequency, 0.0);
        assert_eq!(frame.raw_frequency, 0.0);
        assert_eq!(frame.clarity, 0.0);
        assert_eq!(frame.note, "--");
        assert_abs_diff_eq!(frame.volume, 0.02 / 2f32.sqrt(), epsilon = 0.001);
    }
    assert_eq!(rig.detector.harmonic_stats().len, 0);
}

#[test]
fn volume_follows_sensitivity_and_is_smoothed() {
    let rig = rig_with(DetectorConfig {
        volume_smoothing: 1.0,
        ..DetectorConfig::default()
    });
    let feed = rig.backend.feed().unwrap();

    feed.push_tone(220.0, 0.1, FRAME);
    let quiet = rig.detector.analyze_now().unwrap().unwrap();
    assert_abs_diff_eq!(quiet.raw_volume, 0.1 / 2f32.sqrt(), epsilon = 0.005);

    rig.manager.set_sensitivity(2.0);
    feed.push_tone(220.0, 0.1, FRAME);
    let loud = rig.detector.analyze_now().unwrap().unwrap();
    assert_abs_diff_eq!(loud.raw_volume, 0.2 / 2f32.sqrt(), epsilon = 0.01);
    assert_eq!(loud.volume, loud.raw_volume);
}

#[test]
fn stable_volume_moves_toward_new_level() {
    let rig = rig();
    let feed = rig.backend.feed().unwrap();
    feed.push_tone(220.0, 0.5, FRAME);
    let first = rig.detector.analyze_now().unwrap().unwrap();
    // Smoothing starts from zero.
    assert!(first.volume < first.raw_volume);
    let second = rig.detector.analyze_now().unwrap().unwrap();
    assert!(second.volume > first.volume);
    assert!(second.volume <= second.raw_volume + 1e-6);
}

#[test]
fn octave_jump_is_folded_back() {
    let rig = rig();
    let feed = rig.backend.feed().unwrap();
    for _ in 0..10 {
        feed.push_tone(220.0, 0.5, FRAME);
        let frame = rig.detector.analyze_now().unwrap().unwrap();
        assert_eq!(frame.note, "A3");
    }

    feed.push_tone(440.0, 0.5, FRAME);
    let frame = rig.detector.analyze_now().unwrap().unwrap();
    assert_abs_diff_eq!(frame.raw_frequency, 440.0, epsilon = 2.0);
    assert!(frame.harmonic_corrected);
    assert_abs_diff_eq!(frame.frequency, 220.0, epsilon = 1.0);
    assert_eq!(frame.note, "A3");

    rig.detector.set_harmonic_correction_enabled(false);
    let frame = rig.detector.analyze_now().unwrap().unwrap();
    assert!(!frame.harmonic_corrected);
    assert_eq!(frame.note, "A4");
    assert_eq!(rig.detector.harmonic_stats().len, 0);
}

#[test]
fn panicking_callback_does_not_break_detection() {
    let rig = rig();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    rig.detector.on_pitch_update(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("consumer bug");
    });

    let feed = rig.backend.feed().unwrap();
    feed.push_tone(330.0, 0.5, FRAME);
    assert!(rig.detector.analyze_now().unwrap().is_some());
    assert!(rig.detector.analyze_now().unwrap().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(rig.detector.state(), DetectorState::Ready);
}

#[test]
fn loop_publishes_latest_result_while_detecting() {
    let rig = rig();
    let feed = rig.backend.feed().unwrap();
    feed.push_tone(440.0, 0.5, FRAME);

    rig.detector.start_detection().unwrap();
    assert_eq!(rig.detector.state(), DetectorState::Detecting);
    assert_eq!(rig.detector.performance_stats().fps, 45);

    let found = wait_until(Duration::from_secs(3), || {
        feed.push_tone(440.0, 0.5, 1024);
        rig.detector.latest_result().is_some_and(|f| f.note == "A4")
    });
    assert!(found);

    rig.detector.stop_detection();
    assert_eq!(rig.detector.state(), DetectorState::Ready);
    assert!(rig.detector.latest_result().is_none());
}

#[test]
fn disposed_tap_stops_detection_with_analysis_failure() {
    let rig = rig();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    rig.detector.on_error(move |e| sink.lock().unwrap().push(e.clone()));

    rig.detector.start_detection().unwrap();
    rig.manager.force_cleanup();

    // Callbacks run after the state change, so wait for the report itself.
    assert!(wait_until(Duration::from_secs(3), || !errors.lock().unwrap().is_empty()));
    assert_eq!(rig.detector.state(), DetectorState::Ready);
    let first = errors.lock().unwrap().first().cloned();
    assert!(matches!(first, Some(TrainerError::AnalysisFailure(_))));
    assert!(matches!(rig.detector.analyze_now(), Err(TrainerError::AnalysisFailure(_))));
}

#[test]
fn long_silence_warns_then_stops() {
    let rig = rig_with(DetectorConfig {
        silence: SilenceConfig {
            enabled: true,
            warning_ms: 50,
            timeout_ms: 200,
            min_volume_threshold: 0.01,
        },
        ..DetectorConfig::default()
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    rig.detector.on_silence(move |e| sink.lock().unwrap().push(e));

    rig.detector.start_detection().unwrap();
    let timed_out = || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SilenceEvent::Timeout { .. }))
    };
    assert!(wait_until(Duration::from_secs(3), timed_out));
    assert_eq!(rig.detector.state(), DetectorState::Ready);

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(SilenceEvent::Warning { .. })));
    assert!(matches!(events.last(), Some(SilenceEvent::Timeout { .. })));
    assert!(rig.detector.silence_status().timed_out);
}

#[test]
fn callback_may_stop_its_own_detector() {
    let rig = rig();
    let detector = Arc::new(rig.detector);
    let weak = Arc::downgrade(&detector);
    detector.on_pitch_update(move |_| {
        if let Some(detector) = weak.upgrade() {
            detector.stop_detection();
        }
    });

    detector.start_detection().unwrap();
    assert!(wait_until(Duration::from_secs(3), || detector.state() == DetectorState::Ready));
}

#[test]
fn lifecycle_errors() {
    let backend = ManualBackend::default();
    let manager = AudioManager::with_default_sensitivity(backend, CaptureConfig::default(), 1.0);
    let detector = PitchDetector::new(manager.clone(), DetectorConfig::default()).unwrap();

    assert!(matches!(detector.initialize(), Err(TrainerError::NotReady(_))));
    assert!(matches!(detector.analyze_now(), Err(TrainerError::NotReady(_))));

    manager.acquire().unwrap();
    detector.initialize().unwrap();
    // Initializing twice is a no-op.
    detector.initialize().unwrap();
    assert_eq!(manager.status().tap_ids.len(), 2);

    let taps = detector.tap_ids();
    detector.destroy();
    manager.release(&taps);
    assert_eq!(detector.state(), DetectorState::Destroyed);
    assert_eq!(detector.initialize(), Err(TrainerError::Destroyed));
    assert_eq!(detector.start_detection(), Err(TrainerError::Destroyed));
}

#[test]
fn invalid_config_is_rejected() {
    let backend = ManualBackend::default();
    let manager = AudioManager::with_default_sensitivity(backend, CaptureConfig::default(), 1.0);
    let config = DetectorConfig {
        min_frequency: 900.0,
        max_frequency: 800.0,
        ..DetectorConfig::default()
    };
    assert!(matches!(
        PitchDetector::new(manager, config),
        Err(TrainerError::InvalidConfig(_))
    ));
}
