//! # Fast Fourier Transform (FFT) Module
//!
//! FFT plumbing shared by the analysis taps and the pitch estimator:
//! windowing, magnitude spectra in decibels with analyser-style smoothing,
//! and FFT-based autocorrelation for the McLeod estimator.
//!
//! ## Features
//! - High-performance FFT using RustFFT, planned once per frame size
//! - Blackman window for analyser spectra
//! - DC offset removal
//! - O(n log n) autocorrelation via zero-padded power spectrum

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
pub fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 { return; }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Applies the classic Blackman window (a = 0.16), as used by analyser nodes.
pub fn apply_blackman_window(buffer: &mut [f32]) {
    let n = buffer.len();
    if n < 2 { return; }
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    let n = n as f32;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let x = 2.0 * std::f32::consts::PI * i as f32 / n;
        *sample *= A0 - A1 * x.cos() + A2 * (2.0 * x).cos();
    }
}

/// Smoothed, decibel-clamped magnitude spectrum of fixed-size frames.
///
/// Each call windows the frame, transforms it, normalizes magnitudes by the
/// frame length, blends them with the previous frame by `smoothing`, and
/// reports the result in decibels clamped to `[min_db, max_db]`.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize, smoothing: f32, min_db: f32, max_db: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let mut window = vec![1.0; size];
        apply_blackman_window(&mut window);
        Self {
            fft,
            size,
            window,
            smoothing: smoothing.clamp(0.0, 0.999),
            min_db,
            max_db,
            scratch: vec![Complex::new(0.0, 0.0); size],
            smoothed: vec![0.0; size / 2],
        }
    }

    /// Number of frequency bins produced per frame.
    pub fn bin_count(&self) -> usize {
        self.size / 2
    }

    /// Analyzes `frame` (exactly `size` samples) into `out_db` (`size / 2` bins).
    pub fn analyze(&mut self, frame: &[f32], out_db: &mut [f32]) {
        debug_assert_eq!(frame.len(), self.size);
        for ((slot, &sample), &w) in self.scratch.iter_mut().zip(frame).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let n = self.size as f32;
        for (bin, (smoothed, out)) in self.smoothed.iter_mut().zip(out_db.iter_mut()).enumerate() {
            let magnitude = self.scratch[bin].norm() / n;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            let db = if *smoothed > 0.0 { 20.0 * smoothed.log10() } else { self.min_db };
            *out = db.clamp(self.min_db, self.max_db);
        }
    }

    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// FFT autocorrelation for inputs of one fixed length.
///
/// The input is zero-padded to the next power of two at or above twice its
/// length so the circular correlation equals the linear one for every lag
/// below the input length.
pub struct Autocorrelator {
    input_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
}

impl Autocorrelator {
    pub fn new(input_len: usize) -> Self {
        let padded = (2 * input_len.max(1)).next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            input_len,
            forward: planner.plan_fft_forward(padded),
            inverse: planner.plan_fft_inverse(padded),
            buffer: vec![Complex::new(0.0, 0.0); padded],
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Writes r(τ) = Σ x[i]·x[i+τ] for τ in `0..input_len` into `out`.
    pub fn autocorrelate(&mut self, input: &[f32], out: &mut [f32]) {
        debug_assert_eq!(input.len(), self.input_len);
        debug_assert!(out.len() >= self.input_len);
        let padded = self.buffer.len();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            *slot = Complex::new(input.get(i).copied().unwrap_or(0.0), 0.0);
        }
        self.forward.process(&mut self.buffer);
        for slot in self.buffer.iter_mut() {
            *slot = Complex::new(slot.norm_sqr(), 0.0);
        }
        self.inverse.process(&mut self.buffer);
        // RustFFT leaves the inverse unnormalized.
        let scale = 1.0 / padded as f32;
        for (o, c) in out.iter_mut().zip(self.buffer.iter()).take(self.input_len) {
            *o = c.re * scale;
        }
    }
}
