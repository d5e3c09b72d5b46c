//! # Pitch Detection Module
//!
//! McLeod Pitch Method (MPM) estimator for monophonic voice and instrument
//! input. The normalized square difference function (NSDF) is derived from an
//! FFT autocorrelation, so each estimate costs O(n log n).
//!
//! ## Features
//! - NSDF key-maximum picking with a relative peak threshold to avoid octave errors
//! - Parabolic interpolation for sub-sample lag accuracy
//! - Clarity score in `[0, 1]` alongside every estimate
//! - Optional amplitude gate to skip silent frames

use crate::fft::{remove_dc_offset, Autocorrelator};

/// Fraction of the highest key maximum a peak must reach to be chosen.
pub const DEFAULT_PEAK_THRESHOLD: f32 = 0.9;

/// A frequency estimate together with how periodic the frame was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    pub frequency: f32,
    /// Height of the chosen NSDF peak, capped at 1.0.
    pub clarity: f32,
}

/// Reusable McLeod estimator for frames of one fixed length.
pub struct McLeodDetector {
    autocorrelator: Autocorrelator,
    signal: Vec<f32>,
    nsdf: Vec<f32>,
    peak_threshold: f32,
    min_rms: f32,
}

impl McLeodDetector {
    pub fn new(input_len: usize) -> Self {
        Self {
            autocorrelator: Autocorrelator::new(input_len),
            signal: vec![0.0; input_len],
            nsdf: vec![0.0; input_len],
            peak_threshold: DEFAULT_PEAK_THRESHOLD,
            min_rms: 0.0,
        }
    }

    pub fn input_len(&self) -> usize {
        self.autocorrelator.input_len()
    }

    /// Sets the relative key-maximum threshold. Values outside `(0, 1]` are ignored.
    pub fn set_peak_threshold(&mut self, threshold: f32) {
        if threshold > 0.0 && threshold <= 1.0 {
            self.peak_threshold = threshold;
        }
    }

    /// Frames whose RMS falls below `min_rms` return `None` without analysis.
    pub fn set_min_rms(&mut self, min_rms: f32) {
        self.min_rms = min_rms.max(0.0);
    }

    /// Estimates the fundamental of `signal`.
    ///
    /// # Returns
    /// * `Some(estimate)` - a periodic component was found
    /// * `None` - wrong frame length, frame below the amplitude gate, or no
    ///   positive NSDF lobe after the first zero crossing
    pub fn detect(&mut self, signal: &[f32], sample_rate: f32) -> Option<PitchEstimate> {
        if signal.len() != self.signal.len() || signal.len() < 4 || sample_rate <= 0.0 {
            return None;
        }
        if self.min_rms > 0.0 {
            let rms = (signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32).sqrt();
            if rms < self.min_rms {
                return None;
            }
        }

        self.signal.copy_from_slice(signal);
        remove_dc_offset(&mut self.signal);
        self.compute_nsdf();

        let maxima = key_maxima(&self.nsdf);
        let highest = maxima
            .iter()
            .map(|&i| self.nsdf[i])
            .fold(f32::NEG_INFINITY, f32::max);
        let chosen = *maxima
            .iter()
            .find(|&&i| self.nsdf[i] >= self.peak_threshold * highest)?;

        let (lag, peak) = parabolic_vertex(&self.nsdf, chosen);
        if lag <= 0.0 {
            return None;
        }
        let frequency = sample_rate / lag;
        if !frequency.is_finite() {
            return None;
        }
        Some(PitchEstimate {
            frequency,
            clarity: peak.clamp(0.0, 1.0),
        })
    }

    /// n'(τ) = 2·r(τ) / m(τ), with m(τ) the summed energy of both overlapping
    /// windows, updated incrementally from m(0) = 2·r(0).
    fn compute_nsdf(&mut self) {
        self.autocorrelator.autocorrelate(&self.signal, &mut self.nsdf);
        let n = self.signal.len();
        let mut energy = 2.0 * self.nsdf[0];
        let mut tau = 0;
        while tau < n && energy > 0.0 {
            self.nsdf[tau] = 2.0 * self.nsdf[tau] / energy;
            energy -= self.signal[tau].powi(2) + self.signal[n - tau - 1].powi(2);
            tau += 1;
        }
        self.nsdf[tau..].iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Indices of the highest point of each positive NSDF lobe that starts after
/// a rising zero crossing and closes with a falling one.
fn key_maxima(nsdf: &[f32]) -> Vec<usize> {
    let mut maxima = Vec::new();
    let mut in_lobe = false;
    let mut best = f32::NEG_INFINITY;
    let mut best_index: Option<usize> = None;

    for i in 1..nsdf.len().saturating_sub(1) {
        if nsdf[i - 1] <= 0.0 && nsdf[i] > 0.0 {
            in_lobe = true;
            best = nsdf[i];
            best_index = Some(i);
        } else if nsdf[i - 1] > 0.0 && nsdf[i] <= 0.0 {
            in_lobe = false;
            if let Some(index) = best_index.take() {
                maxima.push(index);
            }
        } else if in_lobe && nsdf[i] > best {
            best = nsdf[i];
            best_index = Some(i);
        }
    }
    maxima
}

/// Vertex `(x, y)` of the parabola through the samples around `index`.
fn parabolic_vertex(values: &[f32], index: usize) -> (f32, f32) {
    if index == 0 || index + 1 >= values.len() {
        return (index as f32, values[index]);
    }
    let y1 = values[index - 1];
    let y2 = values[index];
    let y3 = values[index + 1];
    let denominator = y1 - 2.0 * y2 + y3;
    if denominator.abs() < 1e-12 {
        return (index as f32, y2);
    }
    let shift = 0.5 * (y1 - y3) / denominator;
    let peak = y2 - 0.25 * (y1 - y3) * shift;
    (index as f32 + shift, peak)
}
