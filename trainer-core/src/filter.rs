//! # Noise Filter Module
//!
//! Three biquad stages in fixed order (highpass → lowpass → notch) that bound
//! the signal to the vocal training band before pitch analysis. Removing
//! sub-vocal rumble, hiss and mains hum here keeps out-of-band energy from
//! pulling the autocorrelation toward the wrong period.

use rustfft::num_complex::Complex;
use tracing::debug;

use crate::config::FilterConfig;
use crate::error::{TrainerError, TrainerResult};

/// Flushes values that would otherwise decay into the denormal range.
#[inline]
fn flush_denormal(value: f32) -> f32 {
    if value.abs() < 1e-20 { 0.0 } else { value }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Highpass,
    Lowpass,
    Notch,
}

/// RBJ-cookbook biquad in direct form I, coefficients normalized by a0.
#[derive(Debug, Clone)]
pub struct Biquad {
    kind: FilterKind,
    frequency: f32,
    q: f32,
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn new(kind: FilterKind, sample_rate: u32, frequency: f32, q: f32) -> TrainerResult<Self> {
        let mut filter = Self {
            kind,
            frequency,
            q,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        filter.set_params(sample_rate, frequency, q)?;
        Ok(filter)
    }

    /// Recomputes coefficients while keeping the delay line intact.
    pub fn set_params(&mut self, sample_rate: u32, frequency: f32, q: f32) -> TrainerResult<()> {
        let nyquist = sample_rate as f32 / 2.0;
        if !(frequency > 0.0 && frequency < nyquist) {
            return Err(TrainerError::InvalidConfig(format!(
                "{:?} cutoff {frequency} Hz must be in (0, {nyquist}) Hz",
                self.kind
            )));
        }
        if !(q > 0.0 && q.is_finite()) {
            return Err(TrainerError::InvalidConfig(format!(
                "{:?} Q must be positive, got {q}",
                self.kind
            )));
        }

        let w0 = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let (b0, b1, b2) = match self.kind {
            FilterKind::Highpass => ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0),
            FilterKind::Lowpass => ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0),
            FilterKind::Notch => (1.0, -2.0 * cos_w0, 1.0),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
        self.frequency = frequency;
        self.q = q;
        Ok(())
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let input = if input.is_finite() { input } else { 0.0 };
        let output = self.b0 * input + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;

        self.x2 = flush_denormal(self.x1);
        self.x1 = input;
        self.y2 = flush_denormal(self.y1);
        self.y1 = if output.is_finite() { output } else { 0.0 };
        self.y1
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    /// Magnitude response |H(e^jω)| at `freq`.
    pub fn magnitude_at(&self, freq: f32, sample_rate: u32) -> f32 {
        let w = 2.0 * std::f32::consts::PI * freq / sample_rate as f32;
        let z1 = Complex::from_polar(1.0, -w);
        let z2 = Complex::from_polar(1.0, -2.0 * w);
        let num = Complex::new(self.b0, 0.0) + z1 * self.b1 + z2 * self.b2;
        let den = Complex::new(1.0, 0.0) + z1 * self.a1 + z2 * self.a2;
        let den_norm = den.norm();
        if den_norm < 1e-12 { 0.0 } else { num.norm() / den_norm }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn q(&self) -> f32 {
        self.q
    }
}

/// Partial parameter update; `None` leaves a value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterUpdate {
    pub highpass_freq: Option<f32>,
    pub lowpass_freq: Option<f32>,
    pub notch_freq: Option<f32>,
    pub highpass_q: Option<f32>,
    pub lowpass_q: Option<f32>,
    pub notch_q: Option<f32>,
}

/// Snapshot of a filter chain for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStatus {
    pub connected: bool,
    pub enabled: bool,
    /// (highpass, lowpass, notch) cutoffs in Hz.
    pub frequencies: (f32, f32, f32),
    /// (highpass, lowpass, notch) Q factors.
    pub q_factors: (f32, f32, f32),
}

/// The highpass → lowpass → notch chain, connectable and bypassable as a unit.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    sample_rate: u32,
    highpass: Biquad,
    lowpass: Biquad,
    notch: Biquad,
    enabled: bool,
    connected: bool,
}

impl NoiseFilter {
    pub fn new(config: &FilterConfig, sample_rate: u32) -> TrainerResult<Self> {
        config.validate()?;
        let filter = Self {
            sample_rate,
            highpass: Biquad::new(
                FilterKind::Highpass,
                sample_rate,
                config.highpass_freq,
                config.highpass_q,
            )?,
            lowpass: Biquad::new(
                FilterKind::Lowpass,
                sample_rate,
                config.lowpass_freq,
                config.lowpass_q,
            )?,
            notch: Biquad::new(FilterKind::Notch, sample_rate, config.notch_freq, config.notch_q)?,
            enabled: config.enabled,
            connected: false,
        };
        debug!(
            "[FILTER] chain created: highpass {}Hz (Q={}), lowpass {}Hz (Q={}), notch {}Hz (Q={})",
            config.highpass_freq,
            config.highpass_q,
            config.lowpass_freq,
            config.lowpass_q,
            config.notch_freq,
            config.notch_q
        );
        Ok(filter)
    }

    /// Marks the chain as part of a signal path.
    pub fn connect(&mut self) {
        self.connected = true;
    }

    /// Detaches the chain and clears its delay lines.
    pub fn disconnect(&mut self) {
        self.connected = false;
        self.reset();
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bypass switch. Disabled chains pass audio through untouched.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.reset();
            debug!("[FILTER] filters {}", if enabled { "enabled" } else { "bypassed" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Filters a block in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for sample in samples.iter_mut() {
            let s = self.highpass.process(*sample);
            let s = self.lowpass.process(s);
            *sample = self.notch.process(s);
        }
    }

    /// Applies a partial parameter update without resetting state.
    ///
    /// The whole update is validated before anything changes.
    pub fn update(&mut self, update: FilterUpdate) -> TrainerResult<()> {
        let mut config = self.config();
        config.highpass_freq = update.highpass_freq.unwrap_or(config.highpass_freq);
        config.lowpass_freq = update.lowpass_freq.unwrap_or(config.lowpass_freq);
        config.notch_freq = update.notch_freq.unwrap_or(config.notch_freq);
        config.highpass_q = update.highpass_q.unwrap_or(config.highpass_q);
        config.lowpass_q = update.lowpass_q.unwrap_or(config.lowpass_q);
        config.notch_q = update.notch_q.unwrap_or(config.notch_q);
        config.validate()?;

        let mut highpass = self.highpass.clone();
        let mut lowpass = self.lowpass.clone();
        let mut notch = self.notch.clone();
        highpass.set_params(self.sample_rate, config.highpass_freq, config.highpass_q)?;
        lowpass.set_params(self.sample_rate, config.lowpass_freq, config.lowpass_q)?;
        notch.set_params(self.sample_rate, config.notch_freq, config.notch_q)?;
        self.highpass = highpass;
        self.lowpass = lowpass;
        self.notch = notch;
        debug!("[FILTER] parameters updated: {:?}", update);
        Ok(())
    }

    /// Combined magnitude response of the chain at `freq` (1.0 when bypassed).
    pub fn response(&self, freq: f32) -> f32 {
        if !self.enabled {
            return 1.0;
        }
        self.highpass.magnitude_at(freq, self.sample_rate)
            * self.lowpass.magnitude_at(freq, self.sample_rate)
            * self.notch.magnitude_at(freq, self.sample_rate)
    }

    pub fn config(&self) -> FilterConfig {
        FilterConfig {
            highpass_freq: self.highpass.frequency(),
            lowpass_freq: self.lowpass.frequency(),
            notch_freq: self.notch.frequency(),
            highpass_q: self.highpass.q(),
            lowpass_q: self.lowpass.q(),
            notch_q: self.notch.q(),
            enabled: self.enabled,
        }
    }

    pub fn status(&self) -> FilterStatus {
        FilterStatus {
            connected: self.connected,
            enabled: self.enabled,
            frequencies: (
                self.highpass.frequency(),
                self.lowpass.frequency(),
                self.notch.frequency(),
            ),
            q_factors: (self.highpass.q(), self.lowpass.q(), self.notch.q()),
        }
    }

    pub fn reset(&mut self) {
        self.highpass.reset();
        self.lowpass.reset();
        self.notch.reset();
    }
}
