//! Octave/harmonic error correction backed by a short pitch history.
//!
//! Autocorrelation estimators occasionally lock onto 2× or ½× the sung
//! fundamental for a frame or two. The corrector keeps the accepted
//! frequencies of the last `window_ms`, and once that history is long and
//! stable enough it folds a raw estimate that sits near an integer multiple or
//! submultiple of the history's median back onto the established pitch.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::HarmonicConfig;
use crate::music::calculate_cents_deviation;

/// One accepted estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicEntry {
    pub frequency: f32,
    /// Blend of estimator clarity and continuity with the previous entry.
    pub confidence: f32,
    pub timestamp_ms: u64,
}

/// Result of running one raw estimate through the corrector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub frequency: f32,
    /// `Some(k)` when the raw value was divided by `k` (k > 0) or multiplied
    /// by `-k` (k < 0) to land on the established pitch.
    pub factor: Option<i32>,
}

impl Correction {
    fn passthrough(frequency: f32) -> Self {
        Self { frequency, factor: None }
    }

    pub fn was_corrected(&self) -> bool {
        self.factor.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HarmonicStats {
    pub len: usize,
    pub average_confidence: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Share of entries within tolerance of the median, 0 when empty.
    pub stability: f32,
}

pub struct HarmonicCorrector {
    config: HarmonicConfig,
    history: VecDeque<HarmonicEntry>,
    last_voiced_ms: Option<u64>,
    /// Consecutive frames folded by the same factor.
    streak: (Option<i32>, usize),
}

impl HarmonicCorrector {
    pub fn new(config: HarmonicConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            last_voiced_ms: None,
            streak: (None, 0),
        }
    }

    pub fn config(&self) -> &HarmonicConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Disabling also forgets the history.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.last_voiced_ms = None;
        self.streak = (None, 0);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HarmonicEntry> {
        self.history.iter()
    }

    /// Records a frame without a usable pitch. A gap longer than
    /// `reset_after_silence_ms` since the last voiced frame clears the history.
    pub fn note_unvoiced(&mut self, now_ms: u64) {
        if let Some(last) = self.last_voiced_ms {
            if now_ms.saturating_sub(last) > self.config.reset_after_silence_ms {
                debug!("[HARMONIC] history cleared after {} ms without voice", now_ms - last);
                self.clear();
            }
        }
    }

    /// Corrects `raw` against the history and records the accepted value.
    pub fn correct(&mut self, raw: f32, clarity: f32, now_ms: u64) -> Correction {
        if !self.config.enabled || !(raw > 0.0) {
            return Correction::passthrough(raw);
        }
        self.note_unvoiced(now_ms);
        self.evict(now_ms);

        let mut result = Correction::passthrough(raw);
        if let Some(reference) = self.established_reference() {
            if let Some(folded) = self.fold(raw, reference) {
                result = folded;
            }
        }

        // A register change held for as long as it takes to establish a
        // history is real, not an estimator glitch.
        if result.factor.is_some() && result.factor == self.streak.0 {
            self.streak.1 += 1;
        } else {
            self.streak = (result.factor, usize::from(result.factor.is_some()));
        }
        if result.factor.is_some() && self.streak.1 > self.config.min_samples {
            debug!("[HARMONIC] sustained register change to {:.1} Hz accepted", raw);
            self.history.clear();
            self.streak = (None, 0);
            result = Correction::passthrough(raw);
        } else if let Some(factor) = result.factor {
            debug!("[HARMONIC] octave correction {:.1} Hz -> {:.1} Hz (factor {})", raw, result.frequency, factor);
        }

        self.record(result.frequency, clarity, now_ms);
        result
    }

    pub fn stats(&self) -> HarmonicStats {
        if self.history.is_empty() {
            return HarmonicStats::default();
        }
        let len = self.history.len();
        let average_confidence = self.history.iter().map(|e| e.confidence).sum::<f32>() / len as f32;
        let (min_frequency, max_frequency) = self
            .history
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), e| (lo.min(e.frequency), hi.max(e.frequency)));
        HarmonicStats {
            len,
            average_confidence,
            min_frequency,
            max_frequency,
            stability: self.stability(self.median()),
        }
    }

    fn evict(&mut self, now_ms: u64) {
        let window = self.config.window_ms;
        while let Some(front) = self.history.front() {
            if now_ms.saturating_sub(front.timestamp_ms) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, frequency: f32, clarity: f32, now_ms: u64) {
        let continuity = match self.history.back() {
            Some(prev) => (1.0 - (frequency - prev.frequency).abs() / prev.frequency).max(0.0),
            None => 0.5,
        };
        let confidence = ((clarity * 1.5).min(1.0) + continuity) / 2.0;
        self.history.push_back(HarmonicEntry {
            frequency,
            confidence,
            timestamp_ms: now_ms,
        });
        self.last_voiced_ms = Some(now_ms);
    }

    fn median(&self) -> f32 {
        let mut values: Vec<f32> = self.history.iter().map(|e| e.frequency).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = values.len() / 2;
        if values.is_empty() {
            0.0
        } else if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        }
    }

    fn stability(&self, reference: f32) -> f32 {
        if self.history.is_empty() || reference <= 0.0 {
            return 0.0;
        }
        let close = self
            .history
            .iter()
            .filter(|e| calculate_cents_deviation(e.frequency, reference).abs() <= self.config.tolerance_cents)
            .count();
        close as f32 / self.history.len() as f32
    }

    /// Median of the window when it holds enough mutually consistent entries.
    fn established_reference(&self) -> Option<f32> {
        if self.history.len() < self.config.min_samples {
            return None;
        }
        let reference = self.median();
        (self.stability(reference) >= self.config.min_stability).then_some(reference)
    }

    fn fold(&self, raw: f32, reference: f32) -> Option<Correction> {
        let tolerance = self.config.tolerance_cents;
        if calculate_cents_deviation(raw, reference).abs() <= tolerance {
            return None;
        }
        let mut best: Option<(f32, Correction)> = None;
        for k in 2..=self.config.max_harmonic.max(2) {
            let k_f = k as f32;
            let candidates = [
                (raw / k_f, k as i32),
                (raw * k_f, -(k as i32)),
            ];
            for (candidate, factor) in candidates {
                let error = calculate_cents_deviation(candidate, reference).abs();
                if error <= tolerance && best.is_none_or(|(e, _)| error < e) {
                    best = Some((error, Correction { frequency: candidate, factor: Some(factor) }));
                }
            }
        }
        best.map(|(_, correction)| correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn corrector() -> HarmonicCorrector {
        HarmonicCorrector::new(HarmonicConfig::default())
    }

    fn establish(c: &mut HarmonicCorrector, freq: f32, count: usize, start_ms: u64) -> u64 {
        let mut t = start_ms;
        for _ in 0..count {
            c.correct(freq, 0.95, t);
            t += 20;
        }
        t
    }

    #[test]
    fn octave_jitter_resolves_to_fundamental() {
        let mut c = corrector();
        let mut t = establish(&mut c, 220.0, 8, 0);
        for i in 0..20 {
            let raw = if i % 2 == 0 { 440.0 } else { 220.0 };
            let out = c.correct(raw, 0.9, t);
            assert_relative_eq!(out.frequency, 220.0, epsilon = 0.01);
            t += 20;
        }
    }

    #[test]
    fn sub_octave_estimate_is_folded_up() {
        let mut c = corrector();
        let t = establish(&mut c, 300.0, 8, 0);
        let out = c.correct(150.0, 0.9, t);
        assert_eq!(out.factor, Some(-2));
        assert_relative_eq!(out.frequency, 300.0, epsilon = 0.01);
    }

    #[test]
    fn insufficient_history_passes_through() {
        let mut c = corrector();
        let t = establish(&mut c, 220.0, 7, 0);
        let out = c.correct(440.0, 0.9, t);
        assert_eq!(out.frequency, 440.0);
        assert!(!out.was_corrected());

        let mut empty = corrector();
        assert_eq!(empty.correct(523.25, 0.9, 0).frequency, 523.25);
    }

    #[test]
    fn stale_entries_leave_the_window() {
        let mut c = corrector();
        establish(&mut c, 220.0, 8, 0);
        // Still voiced but past the 2000 ms window.
        c.config.reset_after_silence_ms = u64::MAX;
        let out = c.correct(440.0, 0.9, 5000);
        assert_eq!(out.frequency, 440.0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn silence_gap_clears_history() {
        let mut c = corrector();
        let t = establish(&mut c, 220.0, 8, 0);
        c.note_unvoiced(t + 500);
        assert_eq!(c.len(), 8);
        c.note_unvoiced(t + 1500);
        assert!(c.is_empty());
    }

    #[test]
    fn sustained_register_change_is_accepted() {
        let mut c = corrector();
        let mut t = establish(&mut c, 220.0, 8, 0);
        let mut last = 0.0;
        for _ in 0..12 {
            last = c.correct(440.0, 0.9, t).frequency;
            t += 20;
        }
        assert_relative_eq!(last, 440.0, epsilon = 0.01);
    }

    #[test]
    fn unrelated_jump_is_not_folded() {
        let mut c = corrector();
        let t = establish(&mut c, 220.0, 8, 0);
        // A fifth above is not an integer ratio.
        assert_eq!(c.correct(330.0, 0.9, t).frequency, 330.0);
    }

    #[test]
    fn disabling_clears_and_bypasses() {
        let mut c = corrector();
        let t = establish(&mut c, 220.0, 8, 0);
        c.set_enabled(false);
        assert!(c.is_empty());
        assert_eq!(c.correct(440.0, 0.9, t).frequency, 440.0);
        assert!(c.is_empty());
    }

    #[test]
    fn stats_summarize_window() {
        let mut c = corrector();
        establish(&mut c, 220.0, 4, 0);
        let stats = c.stats();
        assert_eq!(stats.len, 4);
        assert_relative_eq!(stats.min_frequency, 220.0);
        assert_relative_eq!(stats.max_frequency, 220.0);
        assert_relative_eq!(stats.stability, 1.0);
        assert!(stats.average_confidence > 0.7);
    }
}
