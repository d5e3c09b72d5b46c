//! Shared processing graph and the per-consumer analysis taps hanging off it.
//!
//! Captured blocks enter through [`crate::audio::GraphInput`], are scaled by
//! the graph gain (the sensitivity multiplier), optionally shaped by a tap's
//! own [`NoiseFilter`], and land in that tap's ring buffer of `fft_size`
//! samples. Readers copy the ring out on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use thiserror::Error;
use tracing::debug;

use crate::config::TapOptions;
use crate::error::{TrainerError, TrainerResult};
use crate::fft::SpectrumAnalyzer;
use crate::filter::{FilterStatus, FilterUpdate, NoiseFilter};

/// Why a tap read produced no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TapReadError {
    /// The capture side holds the buffer right now; try again next cycle.
    #[error("analysis tap buffer is busy")]
    Busy,
    /// The tap was removed from its graph.
    #[error("analysis tap has been disposed")]
    Disposed,
}

impl From<TapReadError> for TrainerError {
    fn from(err: TapReadError) -> Self {
        TrainerError::AnalysisFailure(err.to_string())
    }
}

/// The gain stage plus every registered tap of one acquisition cycle.
pub(crate) struct AudioGraph {
    sample_rate: AtomicU32,
    gain_bits: AtomicU32,
    taps: RwLock<HashMap<String, Arc<TapCore>>>,
}

impl AudioGraph {
    pub(crate) fn new(sample_rate: u32, gain: f32) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            gain_bits: AtomicU32::new(gain.to_bits()),
            taps: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Adopts the rate the capture stream actually runs at.
    pub(crate) fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    pub(crate) fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn taps_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TapCore>>> {
        self.taps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn taps_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<TapCore>>> {
        self.taps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scales `samples` by the gain and feeds every tap.
    pub(crate) fn ingest(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let gain = self.gain();
        let scaled: Vec<f32> = samples.iter().map(|&s| s * gain).collect();
        for tap in self.taps_read().values() {
            tap.ingest(&scaled);
        }
    }

    pub(crate) fn add_tap(&self, id: &str, options: TapOptions) -> TrainerResult<AnalysisTap> {
        options.validate()?;
        let mut taps = self.taps_write();
        if taps.contains_key(id) {
            return Err(TrainerError::DuplicateTapId(id.to_string()));
        }
        let core = Arc::new(TapCore::new(id, options, self.sample_rate())?);
        taps.insert(id.to_string(), Arc::clone(&core));
        Ok(AnalysisTap { core })
    }

    /// Detaches and disposes `id`. Returns whether it existed.
    pub(crate) fn remove_tap(&self, id: &str) -> bool {
        match self.taps_write().remove(id) {
            Some(core) => {
                core.dispose();
                true
            }
            None => false,
        }
    }

    pub(crate) fn dispose_all(&self) {
        for (_, core) in self.taps_write().drain() {
            core.dispose();
        }
    }

    /// Tap ids, and which of them route through a noise filter.
    pub(crate) fn tap_ids(&self) -> (Vec<String>, Vec<String>) {
        let taps = self.taps_read();
        let mut all: Vec<String> = taps.keys().cloned().collect();
        let mut filtered: Vec<String> = taps
            .values()
            .filter(|t| t.options.use_filters)
            .map(|t| t.id.clone())
            .collect();
        all.sort();
        filtered.sort();
        (all, filtered)
    }
}

struct TapState {
    ring: Vec<f32>,
    write: usize,
    filter: Option<NoiseFilter>,
    scratch: Vec<f32>,
    spectrum: SpectrumAnalyzer,
}

impl TapState {
    fn write(&mut self, samples: &[f32]) {
        let len = self.ring.len();
        // Only the newest `len` samples can survive.
        let samples = &samples[samples.len().saturating_sub(len)..];
        for &s in samples {
            self.ring[self.write] = s;
            self.write = (self.write + 1) % len;
        }
    }

    fn copy_latest(&self, out: &mut [f32]) {
        let len = self.ring.len();
        let start = (self.write + len - out.len()) % len;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.ring[(start + i) % len];
        }
    }
}

pub(crate) struct TapCore {
    id: String,
    options: TapOptions,
    sample_rate: u32,
    state: Mutex<TapState>,
    disposed: AtomicBool,
}

impl TapCore {
    fn new(id: &str, options: TapOptions, sample_rate: u32) -> TrainerResult<Self> {
        let filter = if options.use_filters {
            let mut filter = NoiseFilter::new(&options.filter, sample_rate)?;
            filter.connect();
            Some(filter)
        } else {
            None
        };
        let size = options.fft_size;
        let spectrum = SpectrumAnalyzer::new(size, options.smoothing, options.min_decibels, options.max_decibels);
        Ok(Self {
            id: id.to_string(),
            sample_rate,
            state: Mutex::new(TapState {
                ring: vec![0.0; size],
                write: 0,
                filter,
                scratch: Vec::with_capacity(size),
                spectrum,
            }),
            disposed: AtomicBool::new(false),
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, TapState>, TapReadError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TapReadError::Disposed);
        }
        match self.state.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(TapReadError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    fn ingest(&self, samples: &[f32]) {
        let mut state = self.lock();
        let state = &mut *state;
        match state.filter.as_mut() {
            Some(filter) => {
                state.scratch.clear();
                state.scratch.extend_from_slice(samples);
                filter.process(&mut state.scratch);
                let filtered = std::mem::take(&mut state.scratch);
                state.write(&filtered);
                state.scratch = filtered;
            }
            None => state.write(samples),
        }
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!("[TAP] disposed '{}'", self.id);
        }
    }
}

/// A named, independently configured view onto the shared graph.
///
/// Cloning yields another handle to the same tap.
#[derive(Clone)]
pub struct AnalysisTap {
    core: Arc<TapCore>,
}

impl std::fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisTap")
            .field("id", &self.core.id)
            .field("fft_size", &self.core.options.fft_size)
            .field("use_filters", &self.core.options.use_filters)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl AnalysisTap {
    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn options(&self) -> &TapOptions {
        &self.core.options
    }

    pub fn fft_size(&self) -> usize {
        self.core.options.fft_size
    }

    /// Number of bins returned by [`AnalysisTap::read_frequency_data`].
    pub fn frequency_bin_count(&self) -> usize {
        self.core.options.fft_size / 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.core.sample_rate
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Copies the newest `out.len()` samples (at most `fft_size`), oldest first.
    /// Slots not yet written read as zero.
    pub fn read_time_domain(&self, out: &mut [f32]) -> Result<(), TapReadError> {
        let state = self.core.try_lock()?;
        let n = out.len().min(state.ring.len());
        state.copy_latest(&mut out[..n]);
        out[n..].iter_mut().for_each(|v| *v = 0.0);
        Ok(())
    }

    /// Smoothed magnitude spectrum of the current buffer in decibels, clamped to
    /// the tap's decibel range. `out` receives up to `fft_size / 2` bins.
    pub fn read_frequency_data(&self, out: &mut [f32]) -> Result<(), TapReadError> {
        let mut state = self.core.try_lock()?;
        let state = &mut *state;
        let mut frame = vec![0.0; state.ring.len()];
        state.copy_latest(&mut frame);
        let mut bins = vec![0.0; state.spectrum.bin_count()];
        state.spectrum.analyze(&frame, &mut bins);
        let n = out.len().min(bins.len());
        out[..n].copy_from_slice(&bins[..n]);
        Ok(())
    }

    /// Filter chain status, `None` for unfiltered taps.
    pub fn filter_status(&self) -> Option<FilterStatus> {
        self.core.lock().filter.as_ref().map(NoiseFilter::status)
    }

    pub fn update_filter(&self, update: FilterUpdate) -> TrainerResult<()> {
        match self.core.lock().filter.as_mut() {
            Some(filter) => filter.update(update),
            None => Err(TrainerError::NotReady(format!("tap '{}' has no noise filter", self.core.id))),
        }
    }

    /// Bypasses (or re-engages) this tap's noise filter. No-op for unfiltered taps.
    pub fn set_filter_enabled(&self, enabled: bool) {
        if let Some(filter) = self.core.lock().filter.as_mut() {
            filter.set_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    fn options(fft_size: usize, use_filters: bool) -> TapOptions {
        TapOptions {
            fft_size,
            use_filters,
            ..TapOptions::default()
        }
    }

    #[test]
    fn ring_keeps_newest_samples_in_order() {
        let graph = AudioGraph::new(44100, 1.0);
        let tap = graph.add_tap("t", options(32, false)).unwrap();
        let samples: Vec<f32> = (0..40).map(|i| i as f32).collect();
        graph.ingest(&samples);
        let mut out = vec![0.0; 32];
        tap.read_time_domain(&mut out).unwrap();
        assert_eq!(out[0], 8.0);
        assert_eq!(out[31], 39.0);
    }

    #[test]
    fn gain_scales_ingested_samples() {
        let graph = AudioGraph::new(44100, 2.0);
        let tap = graph.add_tap("t", options(32, false)).unwrap();
        graph.ingest(&[0.25; 32]);
        let mut out = vec![0.0; 32];
        tap.read_time_domain(&mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn duplicate_id_leaves_existing_tap_untouched() {
        let graph = AudioGraph::new(44100, 1.0);
        let first = graph.add_tap("dup", options(64, false)).unwrap();
        let err = graph.add_tap("dup", options(128, true)).unwrap_err();
        assert_eq!(err, TrainerError::DuplicateTapId("dup".into()));
        assert_eq!(first.fft_size(), 64);
        assert!(!first.is_disposed());
        assert_eq!(graph.tap_ids().0, vec!["dup".to_string()]);
    }

    #[test]
    fn removed_tap_reports_disposed() {
        let graph = AudioGraph::new(44100, 1.0);
        let tap = graph.add_tap("gone", options(32, false)).unwrap();
        assert!(graph.remove_tap("gone"));
        assert!(!graph.remove_tap("gone"));
        let mut out = vec![0.0; 32];
        assert_eq!(tap.read_time_domain(&mut out), Err(TapReadError::Disposed));
    }

    #[test]
    fn held_buffer_reads_as_busy() {
        let graph = AudioGraph::new(44100, 1.0);
        let tap = graph.add_tap("busy", options(32, false)).unwrap();
        let _guard = tap.core.lock();
        let mut out = vec![0.0; 32];
        assert_eq!(tap.read_time_domain(&mut out), Err(TapReadError::Busy));
    }

    #[test]
    fn filtered_tap_removes_dc() {
        let graph = AudioGraph::new(44100, 1.0);
        let filtered = graph
            .add_tap("f", TapOptions { fft_size: 1024, use_filters: true, filter: FilterConfig::voice(), ..TapOptions::default() })
            .unwrap();
        let raw = graph.add_tap("r", options(1024, false)).unwrap();
        for _ in 0..20 {
            graph.ingest(&[0.5; 1024]);
        }
        let mut f = vec![0.0; 1024];
        let mut r = vec![0.0; 1024];
        filtered.read_time_domain(&mut f).unwrap();
        raw.read_time_domain(&mut r).unwrap();
        assert!(f.iter().all(|v| v.abs() < 0.01));
        assert!(r.iter().all(|&v| v == 0.5));
        assert!(filtered.filter_status().is_some());
        assert!(raw.filter_status().is_none());
        assert_eq!(graph.tap_ids().1, vec!["f".to_string()]);
    }

    #[test]
    fn frequency_data_fills_bins() {
        let graph = AudioGraph::new(44100, 1.0);
        let tap = graph.add_tap("s", options(256, false)).unwrap();
        let mut bins = vec![0.0; tap.frequency_bin_count()];
        tap.read_frequency_data(&mut bins).unwrap();
        assert!(bins.iter().all(|&db| db == tap.options().min_decibels));
    }
}
