//! # Configuration Module
//!
//! Serde-backed configuration for capture, filtering, analysis taps, harmonic
//! correction, silence tracking, the detector itself, health monitoring and
//! calibration. Every struct uses
//! `#[serde(default)]`, so a JSON document only needs to name the values it
//! overrides.
//!
//! Range-validity problems (min ≥ max, a non power-of-two FFT size) are
//! rejected by `validate()`. Plain scalars such as sensitivity are clamped
//! by their consumers instead.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{TrainerError, TrainerResult};

/// Smallest accepted FFT window.
pub const MIN_FFT_SIZE: usize = 32;

/// Largest accepted FFT window.
pub const MAX_FFT_SIZE: usize = 32768;

/// Settings used when opening the capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channel_count: 1,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        if self.sample_rate < 8000 {
            return Err(invalid(format!(
                "sample_rate must be at least 8000 Hz, got {}",
                self.sample_rate
            )));
        }
        if self.channel_count == 0 {
            return Err(invalid("channel_count must be at least 1"));
        }
        Ok(())
    }
}

/// Cutoffs and Q factors of the three-stage noise filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub highpass_freq: f32,
    pub lowpass_freq: f32,
    /// Mains frequency to reject (50 or 60 Hz depending on region).
    pub notch_freq: f32,
    pub highpass_q: f32,
    pub lowpass_q: f32,
    pub notch_q: f32,
    pub enabled: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::voice()
    }
}

impl FilterConfig {
    /// Human voice training band: breath rumble and hiss removed.
    pub fn voice() -> Self {
        Self {
            highpass_freq: 80.0,
            lowpass_freq: 800.0,
            notch_freq: 60.0,
            highpass_q: 0.7,
            lowpass_q: 0.7,
            notch_q: 10.0,
            enabled: true,
        }
    }

    /// Keeps low fundamentals and more upper harmonics.
    pub fn instrument() -> Self {
        Self {
            highpass_freq: 40.0,
            lowpass_freq: 2000.0,
            notch_freq: 60.0,
            highpass_q: 0.5,
            lowpass_q: 0.5,
            notch_q: 8.0,
            enabled: true,
        }
    }

    pub fn wide() -> Self {
        Self {
            highpass_freq: 20.0,
            lowpass_freq: 5000.0,
            notch_freq: 60.0,
            highpass_q: 0.3,
            lowpass_q: 0.3,
            notch_q: 5.0,
            enabled: true,
        }
    }

    pub fn minimal() -> Self {
        Self {
            highpass_freq: 60.0,
            lowpass_freq: 8000.0,
            notch_freq: 60.0,
            highpass_q: 0.1,
            lowpass_q: 0.1,
            notch_q: 3.0,
            enabled: true,
        }
    }

    /// Filters bypassed entirely.
    pub fn off() -> Self {
        Self {
            enabled: false,
            ..Self::voice()
        }
    }

    /// Looks up a preset by name: `voice`, `instrument`, `wide`, `minimal`.
    /// Any other name yields the bypassed configuration.
    pub fn preset(name: &str) -> Self {
        match name {
            "voice" => Self::voice(),
            "instrument" => Self::instrument(),
            "wide" => Self::wide(),
            "minimal" => Self::minimal(),
            _ => Self::off(),
        }
    }

    pub fn validate(&self) -> TrainerResult<()> {
        let stages = [
            ("highpass", self.highpass_freq, self.highpass_q),
            ("lowpass", self.lowpass_freq, self.lowpass_q),
            ("notch", self.notch_freq, self.notch_q),
        ];
        for (stage, freq, q) in stages {
            if !(freq.is_finite() && freq > 0.0) {
                return Err(invalid(format!("{stage} frequency must be positive, got {freq}")));
            }
            if !(q.is_finite() && q > 0.0) {
                return Err(invalid(format!("{stage} Q must be positive, got {q}")));
            }
        }
        if self.highpass_freq >= self.lowpass_freq {
            return Err(invalid(format!(
                "highpass cutoff ({}) must be below lowpass cutoff ({})",
                self.highpass_freq, self.lowpass_freq
            )));
        }
        Ok(())
    }
}

/// Per-consumer analysis tap options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapOptions {
    pub fft_size: usize,
    /// Spectrum averaging constant in [0, 1): 0 means no smoothing.
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// Route the tap through its own noise filter chain.
    pub use_filters: bool,
    pub filter: FilterConfig,
}

impl Default for TapOptions {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            smoothing: 0.1,
            min_decibels: -90.0,
            max_decibels: -10.0,
            use_filters: true,
            filter: FilterConfig::default(),
        }
    }
}

impl TapOptions {
    pub fn validate(&self) -> TrainerResult<()> {
        validate_fft_size(self.fft_size)?;
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(invalid(format!(
                "smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(invalid(format!(
                "min_decibels ({}) must be below max_decibels ({})",
                self.min_decibels, self.max_decibels
            )));
        }
        if self.use_filters {
            self.filter.validate()?;
        }
        Ok(())
    }
}

/// Octave/harmonic correction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonicConfig {
    pub enabled: bool,
    /// Length of the history window in milliseconds.
    pub window_ms: u64,
    /// Samples required inside the window before correcting.
    pub min_samples: usize,
    /// How close a raw estimate must be to an integer ratio of the reference.
    pub tolerance_cents: f32,
    /// Largest multiple (and submultiple) considered.
    pub max_harmonic: u32,
    /// Share of history that must agree with the reference for it to count as established.
    pub min_stability: f32,
    /// Silence longer than this clears the history.
    pub reset_after_silence_ms: u64,
}

impl Default for HarmonicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 2000,
            min_samples: 8,
            tolerance_cents: 30.0,
            max_harmonic: 4,
            min_stability: 0.6,
            reset_after_silence_ms: 1000,
        }
    }
}

impl HarmonicConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        if self.window_ms == 0 {
            return Err(invalid("harmonic window_ms must be positive"));
        }
        if self.min_samples == 0 {
            return Err(invalid("harmonic min_samples must be at least 1"));
        }
        if !(self.tolerance_cents > 0.0 && self.tolerance_cents < 600.0) {
            return Err(invalid(format!(
                "tolerance_cents must be in (0, 600), got {}",
                self.tolerance_cents
            )));
        }
        if self.max_harmonic < 2 {
            return Err(invalid("max_harmonic must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.min_stability) {
            return Err(invalid("min_stability must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Long-silence reporting. Disabled unless asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    pub enabled: bool,
    pub warning_ms: u64,
    pub timeout_ms: u64,
    pub min_volume_threshold: f32,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            warning_ms: 15_000,
            timeout_ms: 30_000,
            min_volume_threshold: 0.01,
        }
    }
}

impl SilenceConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        if self.timeout_ms != 0 && self.warning_ms > self.timeout_ms {
            return Err(invalid("silence warning_ms must not exceed timeout_ms"));
        }
        if !(0.0..=1.0).contains(&self.min_volume_threshold) {
            return Err(invalid("silence min_volume_threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Pitch detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub fft_size: usize,
    /// Analyser smoothing constant passed to the taps.
    pub smoothing: f32,
    pub clarity_threshold: f32,
    /// Absolute stable-volume floor on the 0-1 scale.
    pub min_volume_absolute: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Weight of the newest raw volume in the exponential smoothing (1.0 = none).
    pub volume_smoothing: f32,
    /// Target cadence of the detection loop.
    pub target_fps: u32,
    pub filter: FilterConfig,
    pub harmonic: HarmonicConfig,
    pub silence: SilenceConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            smoothing: 0.1,
            clarity_threshold: 0.85,
            min_volume_absolute: 0.02,
            min_frequency: 60.0,
            max_frequency: 800.0,
            volume_smoothing: 0.6,
            target_fps: 45,
            filter: FilterConfig::default(),
            harmonic: HarmonicConfig::default(),
            silence: SilenceConfig::default(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        validate_fft_size(self.fft_size)?;
        if !(self.clarity_threshold > 0.0 && self.clarity_threshold <= 1.0) {
            return Err(invalid(format!(
                "clarity_threshold must be in (0, 1], got {}",
                self.clarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_volume_absolute) {
            return Err(invalid(format!(
                "min_volume_absolute must be in [0, 1], got {}",
                self.min_volume_absolute
            )));
        }
        if !(self.min_frequency > 0.0) {
            return Err(invalid("min_frequency must be positive"));
        }
        if self.min_frequency >= self.max_frequency {
            return Err(invalid(format!(
                "min_frequency ({}) must be below max_frequency ({})",
                self.min_frequency, self.max_frequency
            )));
        }
        if !(self.volume_smoothing > 0.0 && self.volume_smoothing <= 1.0) {
            return Err(invalid("volume_smoothing must be in (0, 1]"));
        }
        if self.target_fps == 0 {
            return Err(invalid("target_fps must be positive"));
        }
        self.filter.validate()?;
        self.harmonic.validate()?;
        self.silence.validate()
    }

    /// Options for the filtered (pitch) or raw (volume) tap of a detector.
    pub fn tap_options(&self, use_filters: bool) -> TapOptions {
        TapOptions {
            fft_size: self.fft_size,
            smoothing: self.smoothing,
            use_filters,
            filter: self.filter.clone(),
            ..TapOptions::default()
        }
    }
}

/// Background health checks with bounded automatic recovery. Off unless asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Recovery attempts allowed before giving up until the manager is next idle.
    pub max_recovery_attempts: u32,
    /// Pause between spotting an unhealthy stream and reopening it.
    pub recovery_delay_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5_000,
            max_recovery_attempts: 3,
            recovery_delay_ms: 2_000,
        }
    }
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        if self.interval_ms == 0 {
            return Err(invalid("health interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Phase lengths and targets for device calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub fft_size: usize,
    /// Background noise phase; the user stays quiet.
    pub noise_ms: u64,
    pub noise_interval_ms: u64,
    /// Voice level phase; the user sings at a comfortable level.
    pub volume_ms: u64,
    pub volume_interval_ms: u64,
    /// Frequency balance phase.
    pub response_ms: u64,
    pub response_interval_ms: u64,
    /// RMS the recommended sensitivity aims the median voice level at.
    pub target_volume: f32,
    /// Noise gate headroom over the measured noise RMS.
    pub noise_gate_margin: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            noise_ms: 2_000,
            noise_interval_ms: 100,
            volume_ms: 3_000,
            volume_interval_ms: 50,
            response_ms: 5_000,
            response_interval_ms: 100,
            target_volume: 0.3,
            noise_gate_margin: 2.0,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        validate_fft_size(self.fft_size)?;
        let intervals = [self.noise_interval_ms, self.volume_interval_ms, self.response_interval_ms];
        if intervals.contains(&0) {
            return Err(invalid("calibration sample intervals must be positive"));
        }
        if !(self.target_volume > 0.0 && self.target_volume <= 1.0) {
            return Err(invalid("calibration target_volume must be in (0, 1]"));
        }
        if !(self.noise_gate_margin >= 1.0) {
            return Err(invalid("noise_gate_margin must be at least 1"));
        }
        Ok(())
    }
}

/// Everything a front-end needs, loadable from one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub capture: CaptureConfig,
    pub detector: DetectorConfig,
    /// Initial microphone sensitivity; device default when absent.
    pub sensitivity: Option<f32>,
    pub health: HealthMonitorConfig,
    pub calibration: CalibrationConfig,
}

impl TrainerConfig {
    pub fn validate(&self) -> TrainerResult<()> {
        self.capture.validate()?;
        self.detector.validate()?;
        self.health.validate()?;
        self.calibration.validate()
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> TrainerResult<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> TrainerResult<Self> {
        let config: TrainerConfig =
            serde_json::from_str(data).map_err(|e| invalid(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_fft_size(fft_size: usize) -> TrainerResult<()> {
    if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
        return Err(invalid(format!(
            "fft_size must be a power of two in [{MIN_FFT_SIZE}, {MAX_FFT_SIZE}], got {fft_size}"
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> TrainerError {
    TrainerError::InvalidConfig(msg.into())
}
