//! # trainer-cli
//!
//! Command-line front-end for the trainer core. Acquires the microphone (or
//! a synthetic tone), runs one pitch detector and prints a line for every
//! pitched frame until the requested duration has elapsed.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{after, bounded, select, tick, Sender};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trainer_core::audio::BLOCK_SIZE;
use trainer_core::device::set_device_specs;
use trainer_core::{
    calibrate, device_specs, AudioManager, CalibrationBaseline, CalibrationPhase, CaptureBackend, CpalBackend,
    DetectorConfig, DeviceSpecs, DeviceType, HealthEvent, HealthMonitor, ManualBackend, PitchDetector, PitchFrame,
    SilenceEvent, TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "trainer-cli", version, about = "Real-time pitch and volume detection")]
struct Args {
    /// JSON configuration file; missing fields keep their defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Skip device detection (phone, tablet or desktop)
    #[arg(long, value_name = "TYPE")]
    device_type: Option<DeviceType>,

    /// Microphone gain multiplier, clamped to [0.1, 10]
    #[arg(long, value_name = "X")]
    sensitivity: Option<f32>,

    /// Feed a synthetic sine tone at this frequency instead of the microphone
    #[arg(long, value_name = "HZ")]
    tone: Option<f32>,

    /// How long to run
    #[arg(long, value_name = "N", default_value_t = 10)]
    seconds: u64,

    /// Measure room noise and voice level first and apply the recommended settings
    #[arg(long)]
    calibrate: bool,

    /// Watch the capture stream and reopen it if the device goes away
    #[arg(long)]
    monitor: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => TrainerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TrainerConfig::default(),
    };

    if let Some(device_type) = args.device_type {
        if !set_device_specs(DeviceSpecs::for_type(device_type)) {
            warn!("[MAIN] device specs were already detected; --device-type ignored");
        }
    }
    let specs = device_specs();
    info!(
        "[MAIN] device: {} (sensitivity {}, volume bar x{})",
        specs.device_type, specs.sensitivity_multiplier, specs.volume_bar_scale
    );

    match args.tone {
        Some(frequency) => {
            let backend = ManualBackend::new(config.capture.sample_rate);
            run(&args, &config, specs, backend.clone(), |stop| spawn_tone_feeder(&backend, frequency, stop))
        }
        None => run(&args, &config, specs, CpalBackend::new(), |_| Ok(None)),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Acquires the shared graph, runs a detector for `args.seconds` and releases
/// everything again, whatever happened in between.
fn run<B, F>(args: &Args, config: &TrainerConfig, specs: DeviceSpecs, backend: B, start_source: F) -> Result<()>
where
    B: CaptureBackend + 'static,
    F: FnOnce(crossbeam_channel::Receiver<()>) -> Result<Option<JoinHandle<()>>>,
{
    let manager = AudioManager::new(backend, config.capture.clone());
    manager.acquire().context("acquiring the microphone")?;
    if let Some(sensitivity) = args.sensitivity.or(config.sensitivity) {
        let applied = manager.set_sensitivity(sensitivity);
        info!("[MAIN] sensitivity set to {}", applied);
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    let feeder = match start_source(stop_rx) {
        Ok(feeder) => feeder,
        Err(e) => {
            manager.release::<&str>(&[]);
            return Err(e);
        }
    };

    let mut detector_config = config.detector.clone();
    if args.calibrate {
        run_calibration(&manager, config, &mut detector_config);
    }

    let monitor = if args.monitor || config.health.enabled {
        match HealthMonitor::start(manager.clone(), config.health.clone(), log_health_event) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("[MAIN] health monitor unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let detector = match PitchDetector::new(manager.clone(), detector_config) {
        Ok(detector) => detector,
        Err(e) => {
            drop(monitor);
            stop_feeder(stop_tx, feeder);
            manager.release::<&str>(&[]);
            return Err(e).context("creating the pitch detector");
        }
    };

    let result = detect(args, specs, &detector);

    let taps = detector.tap_ids();
    detector.destroy();
    drop(monitor);
    stop_feeder(stop_tx, feeder);
    manager.release(&taps);
    info!("[MAIN] released audio resources (state {:?})", manager.state());
    result
}

/// Calibrates against the live input and folds the result into
/// `detector_config`. A failed calibration keeps the current settings.
fn run_calibration(manager: &AudioManager, config: &TrainerConfig, detector_config: &mut DetectorConfig) {
    let baseline = CalibrationBaseline::from_current(manager, detector_config);
    let prompt = |phase| match phase {
        CalibrationPhase::Noise => info!("[MAIN] calibrating: stay quiet"),
        CalibrationPhase::Volume => info!("[MAIN] calibrating: sing a comfortable note"),
        CalibrationPhase::Response => info!("[MAIN] calibrating: keep singing"),
    };
    match calibrate(manager, &config.calibration, baseline, prompt) {
        Ok(calibration) => {
            calibration.settings.apply(manager, detector_config);
            info!(
                "[MAIN] calibrated: voice median {:.3}, noise {:.4}, sensitivity {}, gate {}",
                calibration.volume.median,
                calibration.noise.rms,
                calibration.settings.sensitivity,
                calibration.settings.noise_gate
            );
        }
        Err(e) => warn!("[MAIN] calibration failed, keeping current settings: {}", e),
    }
}

fn log_health_event(event: &HealthEvent) {
    match event {
        HealthEvent::Unhealthy(status) => warn!("[MAIN] microphone unhealthy ({:?})", status.stream),
        HealthEvent::RecoveryStarted { attempt, max_attempts } => {
            info!("[MAIN] reopening microphone ({}/{})", attempt, max_attempts)
        }
        HealthEvent::Recovered { .. } => info!("[MAIN] microphone recovered"),
        HealthEvent::RecoveryFailed { attempt, error } => warn!("[MAIN] reopen attempt {} failed: {}", attempt, error),
        HealthEvent::GaveUp { attempts } => error!("[MAIN] microphone lost after {} reopen attempts", attempts),
    }
}

fn detect(args: &Args, specs: DeviceSpecs, detector: &PitchDetector) -> Result<()> {
    let (frame_tx, frame_rx) = bounded::<PitchFrame>(64);
    detector.on_pitch_update(move |frame| {
        if frame.is_pitched() {
            let _ = frame_tx.try_send(frame.clone());
        }
    });
    detector.on_error(|e| error!("[DETECTOR] {}", e));
    detector.on_state_change(|state| info!("[DETECTOR] state: {}", state));
    detector.on_silence(|event| match event {
        SilenceEvent::Warning { silent_ms } => warn!("[DETECTOR] no input for {} ms", silent_ms),
        SilenceEvent::Timeout { silent_ms } => warn!("[DETECTOR] stopped after {} ms of silence", silent_ms),
        SilenceEvent::Recovered => info!("[DETECTOR] input recovered"),
    });

    detector.initialize().context("initializing the pitch detector")?;
    detector.start_detection().context("starting detection")?;

    let deadline = after(Duration::from_secs(args.seconds));
    let stats = tick(Duration::from_secs(5));
    loop {
        select! {
            recv(frame_rx) -> frame => {
                if let Ok(frame) = frame {
                    println!("{}", format_frame(&frame, &specs));
                }
            }
            recv(stats) -> _ => {
                let perf = detector.performance_stats();
                info!("[MAIN] {} fps, {} drops", perf.fps, perf.frame_drops);
            }
            recv(deadline) -> _ => break,
        }
    }
    detector.stop_detection();
    Ok(())
}

fn format_frame(frame: &PitchFrame, specs: &DeviceSpecs) -> String {
    const BAR_WIDTH: usize = 20;
    let filled = ((specs.volume_percent(frame.volume) / 100.0) * BAR_WIDTH as f32).round() as usize;
    let bar: String = (0..BAR_WIDTH).map(|i| if i < filled { '#' } else { '.' }).collect();
    format!(
        "{:<4} {:>8.2} Hz {:>+6.1} ct  clarity {:.2}  [{}]{}",
        frame.note,
        frame.frequency,
        frame.cents.unwrap_or(0.0),
        frame.clarity,
        bar,
        if frame.harmonic_corrected { " (octave corrected)" } else { "" }
    )
}

/// Pushes the tone in `BLOCK_SIZE` blocks at roughly real-time pace.
fn spawn_tone_feeder(
    backend: &ManualBackend,
    frequency: f32,
    stop: crossbeam_channel::Receiver<()>,
) -> Result<Option<JoinHandle<()>>> {
    let feed = backend.feed().context("synthetic track is not open")?;
    let block = Duration::from_secs_f64(BLOCK_SIZE as f64 / feed.sample_rate() as f64);
    info!("[MAIN] feeding a {} Hz tone", frequency);
    let handle = thread::Builder::new()
        .name("tone-feeder".into())
        .spawn(move || {
            let pace = tick(block);
            loop {
                select! {
                    recv(stop) -> _ => break,
                    recv(pace) -> _ => feed.push_tone(frequency, 0.5, BLOCK_SIZE),
                }
            }
        })
        .context("spawning the tone feeder")?;
    Ok(Some(handle))
}

fn stop_feeder(stop_tx: Sender<()>, feeder: Option<JoinHandle<()>>) {
    drop(stop_tx);
    if let Some(handle) = feeder {
        let _ = handle.join();
    }
}
