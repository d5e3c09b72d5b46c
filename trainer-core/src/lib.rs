// trainer-core/src/lib.rs

//! The core logic for the ear trainer's real-time pitch detection.
//! This crate is responsible for microphone capture, noise filtering,
//! pitch and volume estimation, octave-error correction, capture health
//! monitoring and device calibration. It is completely headless and
//! contains no UI code.
//!
//! A typical session shares one [`AudioManager`] between all consumers:
//!
//! ```no_run
//! use trainer_core::{AudioManager, CaptureConfig, CpalBackend, DetectorConfig, PitchDetector};
//!
//! # fn main() -> Result<(), trainer_core::TrainerError> {
//! let manager = AudioManager::new(CpalBackend::new(), CaptureConfig::default());
//! manager.acquire()?;
//! let detector = PitchDetector::new(manager.clone(), DetectorConfig::default())?;
//! detector.on_pitch_update(|frame| println!("{} {:.1} Hz", frame.note, frame.frequency));
//! detector.initialize()?;
//! detector.start_detection()?;
//! // ...
//! let taps = detector.tap_ids();
//! detector.destroy();
//! manager.release(&taps);
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod calibration;
pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod fft;
pub mod filter;
pub mod harmonic;
pub mod health;
pub mod manager;
pub mod music;
pub mod pitch;
pub mod tap;
pub mod timing;

pub use audio::{CaptureBackend, CaptureStream, CpalBackend, ManualBackend, ManualFeed, StreamHealth};
pub use calibration::{calibrate, Calibration, CalibrationBaseline, CalibrationPhase, CalibrationSettings};
pub use config::{
    CalibrationConfig, CaptureConfig, DetectorConfig, FilterConfig, HarmonicConfig, HealthMonitorConfig,
    SilenceConfig, TapOptions, TrainerConfig,
};
pub use detector::{DetectorCallbacks, DetectorState, FrameStatus, PitchDetector, PitchFrame};
pub use device::{device_specs, DeviceProfiler, DeviceSpecs, DeviceType, EnvironmentInfo};
pub use error::{TrainerError, TrainerResult};
pub use filter::{FilterStatus, FilterUpdate, NoiseFilter};
pub use health::{HealthEvent, HealthMonitor, MonitorStats};
pub use manager::{AudioManager, GraphState, HealthStatus, ManagerStatus};
pub use tap::{AnalysisTap, TapReadError};
pub use timing::{PerformanceStats, SilenceEvent, SilenceStatus};
