//! # Calibration Module
//!
//! Measures a microphone in three phases over a dedicated, unfiltered
//! analysis tap and turns the measurements into recommended settings:
//!
//! 1. **Noise**: the user stays quiet; records the background RMS and the
//!    averaged spectrum of the room.
//! 2. **Volume**: the user sings; records the spread of voice RMS levels.
//! 3. **Response**: the user keeps singing; averages the spectrum over the
//!    voice band (80-1000 Hz) to see which end of it the device favours.
//!
//! The recommendation scales the gain so the median voice level lands on
//! `target_volume`, puts the noise gate above the (rescaled) noise floor and
//! moves the band-pass edges when one end of the band is weak or loud.
//!
//! [`CalibrationSession`] holds the arithmetic and can be fed by hand;
//! [`calibrate`] drives it in real time against an [`AudioManager`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{after, select, tick};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{CalibrationConfig, DetectorConfig, FilterConfig, TapOptions};
use crate::detector::PitchDetector;
use crate::error::{TrainerError, TrainerResult};
use crate::filter::FilterUpdate;
use crate::manager::{AudioManager, MAX_SENSITIVITY, MIN_SENSITIVITY};
use crate::tap::{AnalysisTap, TapReadError};

/// Band whose average level describes the background noise.
const NOISE_BAND_HZ: (f32, f32) = (100.0, 800.0);

/// Band examined for the device's frequency balance.
const RESPONSE_BAND_HZ: (f32, f32) = (80.0, 1000.0);

/// Gain changes are limited to halving or doubling per calibration.
const GAIN_FACTOR_RANGE: (f32, f32) = (0.5, 2.0);

static NEXT_CALIBRATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationPhase {
    Noise,
    Volume,
    Response,
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationPhase::Noise => "noise",
            CalibrationPhase::Volume => "volume",
            CalibrationPhase::Response => "response",
        })
    }
}

/// Settings in force before calibration; the recommendation starts from them.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBaseline {
    pub sensitivity: f32,
    pub noise_gate: f32,
    pub filter: FilterConfig,
}

impl CalibrationBaseline {
    pub fn from_current(manager: &AudioManager, detector: &DetectorConfig) -> Self {
        Self {
            sensitivity: manager.sensitivity(),
            noise_gate: detector.min_volume_absolute,
            filter: detector.filter.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseProfile {
    /// Mean RMS of the quiet phase.
    pub rms: f32,
    /// Mean level of the 100-800 Hz bins in dB.
    pub band_db: f32,
    pub snapshots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeLevels {
    pub min: f32,
    pub max: f32,
    pub median: f32,
    /// `target_volume - median`: positive when the voice arrives too quietly.
    pub offset: f32,
    pub snapshots: usize,
}

/// Mean dB of the lower 30%, middle 40% and upper 30% of the voice band bins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencyResponse {
    pub low_db: f32,
    pub mid_db: f32,
    pub high_db: f32,
    pub snapshots: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub sensitivity: f32,
    /// Recommended `min_volume_absolute`.
    pub noise_gate: f32,
    pub volume_offset: f32,
    pub filter: FilterConfig,
}

impl CalibrationSettings {
    /// Applies the gain to `manager` and the gate and filter to `config`,
    /// which takes effect for detectors created from it. Returns the gain
    /// actually applied.
    pub fn apply(&self, manager: &AudioManager, config: &mut DetectorConfig) -> f32 {
        let applied = manager.set_sensitivity(self.sensitivity);
        config.min_volume_absolute = self.noise_gate;
        config.filter = FilterConfig {
            enabled: config.filter.enabled,
            ..self.filter.clone()
        };
        info!(
            "[CALIBRATION] applied: sensitivity {}, noise gate {}, band {}-{} Hz",
            applied, self.noise_gate, self.filter.highpass_freq, self.filter.lowpass_freq
        );
        applied
    }

    /// Retunes the filter chain of an initialized detector in place.
    pub fn apply_filter(&self, detector: &PitchDetector) -> TrainerResult<()> {
        detector.update_filter(self.filter_update())
    }

    pub fn filter_update(&self) -> FilterUpdate {
        FilterUpdate {
            highpass_freq: Some(self.filter.highpass_freq),
            lowpass_freq: Some(self.filter.lowpass_freq),
            notch_freq: Some(self.filter.notch_freq),
            highpass_q: Some(self.filter.highpass_q),
            lowpass_q: Some(self.filter.lowpass_q),
            notch_q: Some(self.filter.notch_q),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub noise: NoiseProfile,
    pub volume: VolumeLevels,
    pub response: FrequencyResponse,
    pub settings: CalibrationSettings,
}

/// Accumulates snapshots per phase and derives the recommendation.
pub struct CalibrationSession {
    config: CalibrationConfig,
    baseline: CalibrationBaseline,
    bin_hz: f32,
    time: Vec<f32>,
    bins: Vec<f32>,
    noise_rms: Vec<f32>,
    noise_spectrum: Vec<f64>,
    noise_spectra: usize,
    levels: Vec<f32>,
    response_spectrum: Vec<f64>,
    response_spectra: usize,
}

impl CalibrationSession {
    /// Session for a tap of `fft_size` samples at `sample_rate`.
    pub fn new(config: CalibrationConfig, baseline: CalibrationBaseline, sample_rate: u32, fft_size: usize) -> Self {
        let bin_count = fft_size / 2;
        Self {
            config,
            baseline,
            bin_hz: sample_rate as f32 / fft_size as f32,
            time: vec![0.0; fft_size],
            bins: vec![0.0; bin_count],
            noise_rms: Vec::new(),
            noise_spectrum: vec![0.0; bin_count],
            noise_spectra: 0,
            levels: Vec::new(),
            response_spectrum: vec![0.0; bin_count],
            response_spectra: 0,
        }
    }

    /// Takes one snapshot of `tap` for `phase`.
    pub fn sample(&mut self, phase: CalibrationPhase, tap: &AnalysisTap) -> Result<(), TapReadError> {
        match phase {
            CalibrationPhase::Noise => {
                tap.read_time_domain(&mut self.time)?;
                tap.read_frequency_data(&mut self.bins)?;
                self.noise_rms.push(rms(&self.time));
                accumulate(&mut self.noise_spectrum, &self.bins);
                self.noise_spectra += 1;
            }
            CalibrationPhase::Volume => {
                tap.read_time_domain(&mut self.time)?;
                self.levels.push(rms(&self.time));
            }
            CalibrationPhase::Response => {
                tap.read_frequency_data(&mut self.bins)?;
                accumulate(&mut self.response_spectrum, &self.bins);
                self.response_spectra += 1;
            }
        }
        Ok(())
    }

    /// Derives the measurements and recommendation. Fails when a phase
    /// collected nothing.
    pub fn finish(&self) -> TrainerResult<Calibration> {
        if self.noise_rms.is_empty() || self.levels.is_empty() || self.response_spectra == 0 {
            return Err(TrainerError::AnalysisFailure(format!(
                "calibration incomplete: {} noise, {} volume, {} response snapshots",
                self.noise_rms.len(),
                self.levels.len(),
                self.response_spectra
            )));
        }

        let noise = NoiseProfile {
            rms: mean(self.noise_rms.iter().copied()),
            band_db: self.band_mean(&self.noise_spectrum, self.noise_spectra, NOISE_BAND_HZ),
            snapshots: self.noise_rms.len(),
        };

        let mut sorted = self.levels.clone();
        sorted.sort_by(f32::total_cmp);
        let median = sorted[sorted.len() / 2];
        let volume = VolumeLevels {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            median,
            offset: self.config.target_volume - median,
            snapshots: sorted.len(),
        };

        let response = self.frequency_response();
        let settings = self.recommend(&noise, &volume, &response);
        debug!("[CALIBRATION] noise {:?}, volume {:?}, response {:?}", noise, volume, response);
        Ok(Calibration {
            noise,
            volume,
            response,
            settings,
        })
    }

    fn recommend(&self, noise: &NoiseProfile, volume: &VolumeLevels, response: &FrequencyResponse) -> CalibrationSettings {
        let (lo, hi) = GAIN_FACTOR_RANGE;
        let factor = if volume.median > 0.0 {
            (self.config.target_volume / volume.median).clamp(lo, hi)
        } else {
            hi
        };
        let sensitivity = round_to(
            (self.baseline.sensitivity * factor).clamp(MIN_SENSITIVITY, MAX_SENSITIVITY),
            1,
        );
        // The noise floor was measured at the old gain.
        let gate = (noise.rms * factor * self.config.noise_gate_margin).min(1.0);
        let noise_gate = round_to(gate.max(self.baseline.noise_gate), 3);

        let voice = FilterConfig::voice();
        let filter = FilterConfig {
            highpass_freq: if response.low_db < response.mid_db - 5.0 { 100.0 } else { voice.highpass_freq },
            lowpass_freq: if response.high_db > response.mid_db + 3.0 { 600.0 } else { voice.lowpass_freq },
            notch_freq: self.baseline.filter.notch_freq,
            ..voice
        };

        CalibrationSettings {
            sensitivity,
            noise_gate,
            volume_offset: volume.offset,
            filter,
        }
    }

    fn frequency_response(&self) -> FrequencyResponse {
        let band: Vec<f32> = self
            .band_bins(RESPONSE_BAND_HZ)
            .map(|bin| (self.response_spectrum[bin] / self.response_spectra as f64) as f32)
            .collect();
        let low_end = band.len() * 3 / 10;
        let high_start = band.len() * 7 / 10;
        FrequencyResponse {
            low_db: mean(band[..low_end].iter().copied()),
            mid_db: mean(band[low_end..high_start].iter().copied()),
            high_db: mean(band[high_start..].iter().copied()),
            snapshots: self.response_spectra,
        }
    }

    fn band_bins(&self, (lo, hi): (f32, f32)) -> impl Iterator<Item = usize> + '_ {
        (0..self.bins.len()).filter(move |&bin| {
            let hz = bin as f32 * self.bin_hz;
            hz >= lo && hz <= hi
        })
    }

    fn band_mean(&self, sums: &[f64], count: usize, band: (f32, f32)) -> f32 {
        mean(self.band_bins(band).map(|bin| (sums[bin] / count as f64) as f32))
    }
}

/// Runs all three phases against `manager`, which must already be acquired.
///
/// `on_phase` is called as each phase begins so a front-end can prompt the
/// user. The calibration tap is removed again whatever the outcome.
pub fn calibrate(
    manager: &AudioManager,
    config: &CalibrationConfig,
    baseline: CalibrationBaseline,
    mut on_phase: impl FnMut(CalibrationPhase),
) -> TrainerResult<Calibration> {
    config.validate()?;
    let tap_id = format!("calibration-{}", NEXT_CALIBRATION_ID.fetch_add(1, Ordering::Relaxed));
    let tap = manager.create_analysis_tap(
        &tap_id,
        TapOptions {
            fft_size: config.fft_size,
            smoothing: 0.0,
            use_filters: false,
            ..TapOptions::default()
        },
    )?;
    info!("[CALIBRATION] starting on tap '{}'", tap_id);

    let mut session = CalibrationSession::new(config.clone(), baseline, tap.sample_rate(), config.fft_size);
    let phases = [
        (CalibrationPhase::Noise, config.noise_ms, config.noise_interval_ms),
        (CalibrationPhase::Volume, config.volume_ms, config.volume_interval_ms),
        (CalibrationPhase::Response, config.response_ms, config.response_interval_ms),
    ];
    let measured = phases.into_iter().try_for_each(|(phase, duration_ms, interval_ms)| {
        on_phase(phase);
        debug!("[CALIBRATION] {} phase for {} ms", phase, duration_ms);
        run_phase(&mut session, &tap, phase, duration_ms, interval_ms)
    });
    manager.remove_tap(&tap_id);

    measured?;
    let calibration = session.finish()?;
    info!(
        "[CALIBRATION] done: sensitivity {}, noise gate {}",
        calibration.settings.sensitivity, calibration.settings.noise_gate
    );
    Ok(calibration)
}

fn run_phase(
    session: &mut CalibrationSession,
    tap: &AnalysisTap,
    phase: CalibrationPhase,
    duration_ms: u64,
    interval_ms: u64,
) -> TrainerResult<()> {
    let ticker = tick(std::time::Duration::from_millis(interval_ms));
    let deadline = after(std::time::Duration::from_millis(duration_ms));
    let mut snapshot = || match session.sample(phase, tap) {
        // A busy buffer just skips this snapshot.
        Ok(()) | Err(TapReadError::Busy) => Ok(()),
        Err(TapReadError::Disposed) => Err(TrainerError::AnalysisFailure(format!(
            "calibration tap '{}' was disposed during the {} phase",
            tap.id(),
            phase
        ))),
    };
    snapshot()?;
    loop {
        select! {
            recv(ticker) -> _ => snapshot()?,
            recv(deadline) -> _ => return Ok(()),
        }
    }
}

fn accumulate(sums: &mut [f64], bins: &[f32]) {
    for (sum, &db) in sums.iter_mut().zip(bins) {
        *sum += db as f64;
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f32 }
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let scale = 10f32.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ManualBackend;
    use crate::config::CaptureConfig;
    use approx::assert_abs_diff_eq;

    const FFT: usize = 2048;

    fn rig() -> (AudioManager, ManualBackend, AnalysisTap) {
        let backend = ManualBackend::default();
        let manager = AudioManager::with_default_sensitivity(backend.clone(), CaptureConfig::default(), 1.0);
        manager.acquire().unwrap();
        let tap = manager
            .create_analysis_tap(
                "cal",
                TapOptions { fft_size: FFT, smoothing: 0.0, use_filters: false, ..TapOptions::default() },
            )
            .unwrap();
        (manager, backend, tap)
    }

    fn baseline() -> CalibrationBaseline {
        CalibrationBaseline {
            sensitivity: 1.0,
            noise_gate: 0.02,
            filter: FilterConfig::voice(),
        }
    }

    fn session() -> CalibrationSession {
        CalibrationSession::new(CalibrationConfig::default(), baseline(), 44100, FFT)
    }

    /// Mains hum as room noise, then a voice tone for the level and response phases.
    fn measure(hum: f32, voice_hz: f32, voice_amplitude: f32) -> Calibration {
        let (_manager, backend, tap) = rig();
        let feed = backend.feed().unwrap();
        let mut session = session();
        for _ in 0..4 {
            feed.push_tone(50.0, hum, FFT);
            session.sample(CalibrationPhase::Noise, &tap).unwrap();
        }
        for _ in 0..4 {
            feed.push_tone(voice_hz, voice_amplitude, FFT);
            session.sample(CalibrationPhase::Volume, &tap).unwrap();
            session.sample(CalibrationPhase::Response, &tap).unwrap();
        }
        session.finish().unwrap()
    }

    #[test]
    fn loud_voice_lowers_sensitivity_and_raises_gate() {
        // Voice RMS ~0.42 against a 0.3 target; hum RMS ~0.028.
        let calibration = measure(0.04, 440.0, 0.6);
        assert_abs_diff_eq!(calibration.volume.median, 0.6 / 2f32.sqrt(), epsilon = 0.01);
        assert!(calibration.volume.offset < 0.0);
        assert_eq!(calibration.settings.sensitivity, 0.7);
        assert_abs_diff_eq!(calibration.noise.rms, 0.04 / 2f32.sqrt(), epsilon = 0.002);
        // 0.028 hum x 0.707 gain x 2 margin.
        assert_abs_diff_eq!(calibration.settings.noise_gate, 0.04, epsilon = 0.002);
    }

    #[test]
    fn quiet_voice_gain_is_capped_at_double() {
        let calibration = measure(0.001, 440.0, 0.05);
        assert_eq!(calibration.settings.sensitivity, 2.0);
        // Negligible noise keeps the configured gate.
        assert_eq!(calibration.settings.noise_gate, 0.02);
    }

    #[test]
    fn weak_low_end_raises_the_highpass() {
        // Energy concentrated mid-band leaves the low bins near the floor.
        let calibration = measure(0.001, 500.0, 0.5);
        assert!(calibration.response.low_db < calibration.response.mid_db - 5.0);
        assert_eq!(calibration.settings.filter.highpass_freq, 100.0);
        assert_eq!(calibration.settings.filter.notch_freq, 60.0);
    }

    #[test]
    fn strong_high_end_lowers_the_lowpass() {
        let calibration = measure(0.001, 900.0, 0.5);
        assert!(calibration.response.high_db > calibration.response.mid_db + 3.0);
        assert_eq!(calibration.settings.filter.lowpass_freq, 600.0);
    }

    #[test]
    fn missing_phase_is_an_analysis_failure() {
        let (_manager, backend, tap) = rig();
        backend.feed().unwrap().push_tone(220.0, 0.3, FFT);
        let mut session = session();
        session.sample(CalibrationPhase::Noise, &tap).unwrap();
        session.sample(CalibrationPhase::Volume, &tap).unwrap();
        assert!(matches!(session.finish(), Err(TrainerError::AnalysisFailure(_))));
    }

    #[test]
    fn disposed_tap_is_reported() {
        let (manager, _, tap) = rig();
        manager.force_cleanup();
        let mut session = session();
        assert_eq!(session.sample(CalibrationPhase::Volume, &tap), Err(TapReadError::Disposed));
    }

    #[test]
    fn apply_sets_gain_gate_and_band() {
        let (manager, _, _) = rig();
        let settings = CalibrationSettings {
            sensitivity: 2.5,
            noise_gate: 0.035,
            volume_offset: 0.1,
            filter: FilterConfig { highpass_freq: 100.0, lowpass_freq: 600.0, ..FilterConfig::voice() },
        };
        let mut config = DetectorConfig::default();
        assert_eq!(settings.apply(&manager, &mut config), 2.5);
        assert_eq!(manager.sensitivity(), 2.5);
        assert_eq!(config.min_volume_absolute, 0.035);
        assert_eq!((config.filter.highpass_freq, config.filter.lowpass_freq), (100.0, 600.0));
        config.validate().unwrap();
    }
}
