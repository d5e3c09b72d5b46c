//! Loop pacing and long-silence tracking for the detection loop.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SilenceConfig;

pub const MIN_FPS: u32 = 30;
pub const MAX_FPS: u32 = 60;
pub const OPTIMAL_FPS: u32 = 45;

/// Frames arriving later than this many intervals count as dropped.
const LATE_FACTOR: f64 = 1.5;
/// Drops tolerated before the target rate is lowered.
const MAX_DROPS: u32 = 5;
const FPS_STEP: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub fps: u32,
    pub frame_drops: u32,
    pub interval_ms: f64,
}

/// Adaptive frame pacing: backs off under load, recovers when frames are on time.
#[derive(Debug, Clone)]
pub struct FrameRateLimiter {
    optimal_fps: u32,
    target_fps: u32,
    interval: Duration,
    last_frame: Option<Instant>,
    next_frame: Option<Instant>,
    frame_drops: u32,
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps as f64)
}

impl FrameRateLimiter {
    pub fn new(target_fps: u32) -> Self {
        let fps = target_fps.clamp(MIN_FPS, MAX_FPS);
        Self {
            optimal_fps: fps,
            target_fps: fps,
            interval: interval_for(fps),
            last_frame: None,
            next_frame: None,
            frame_drops: 0,
        }
    }

    /// Whether a frame is due at `now`. Records the frame when it is.
    pub fn should_process(&mut self, now: Instant) -> bool {
        let Some(next) = self.next_frame else {
            self.last_frame = Some(now);
            self.next_frame = Some(now + self.interval);
            return true;
        };
        if now < next {
            return false;
        }
        if let Some(last) = self.last_frame {
            if now.duration_since(last).as_secs_f64() > self.interval.as_secs_f64() * LATE_FACTOR {
                self.frame_drops += 1;
                self.adjust();
            }
        }
        self.last_frame = Some(now);
        self.next_frame = Some(now + self.interval);
        true
    }

    /// How long until the next frame is due.
    pub fn time_until_next(&self, now: Instant) -> Duration {
        self.next_frame.map_or(Duration::ZERO, |next| next.saturating_duration_since(now))
    }

    fn adjust(&mut self) {
        if self.frame_drops > MAX_DROPS && self.target_fps > MIN_FPS {
            self.target_fps = (self.target_fps - FPS_STEP).max(MIN_FPS);
            self.interval = interval_for(self.target_fps);
            self.frame_drops = 0;
            info!("[PITCH-DETECTOR] adjusted loop to {} fps due to high load", self.target_fps);
        }
    }

    /// Steps back toward the optimal rate after a clean frame.
    pub fn recover(&mut self) {
        if self.frame_drops == 0 && self.target_fps < self.optimal_fps {
            self.target_fps = (self.target_fps + FPS_STEP).min(self.optimal_fps);
            self.interval = interval_for(self.target_fps);
            debug!("[PITCH-DETECTOR] loop recovered to {} fps", self.target_fps);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.optimal_fps);
    }

    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats {
            fps: self.target_fps,
            frame_drops: self.frame_drops,
            interval_ms: self.interval.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SilenceEvent {
    Warning { silent_ms: u64 },
    /// Detection stops after this event.
    Timeout { silent_ms: u64 },
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SilenceStatus {
    pub enabled: bool,
    pub is_silent: bool,
    pub silent_ms: u64,
    pub warned: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct SilenceTracker {
    config: SilenceConfig,
    silent_since: Option<u64>,
    last_update: u64,
    warned: bool,
    timed_out: bool,
}

impl SilenceTracker {
    pub fn new(config: SilenceConfig) -> Self {
        Self {
            config,
            silent_since: None,
            last_update: 0,
            warned: false,
            timed_out: false,
        }
    }

    pub fn reset(&mut self) {
        self.silent_since = None;
        self.warned = false;
        self.timed_out = false;
    }

    /// Feeds one stable-volume reading. A zero `warning_ms`/`timeout_ms`
    /// disables that stage.
    pub fn update(&mut self, volume: f32, now_ms: u64) -> Option<SilenceEvent> {
        if !self.config.enabled {
            return None;
        }
        self.last_update = now_ms;
        if volume >= self.config.min_volume_threshold {
            let was_reported = self.warned || self.timed_out;
            let was_silent = self.silent_since.is_some();
            self.reset();
            return (was_silent && was_reported).then_some(SilenceEvent::Recovered);
        }

        let since = *self.silent_since.get_or_insert(now_ms);
        let silent_ms = now_ms.saturating_sub(since);
        if !self.timed_out && self.config.timeout_ms > 0 && silent_ms >= self.config.timeout_ms {
            self.timed_out = true;
            return Some(SilenceEvent::Timeout { silent_ms });
        }
        if !self.warned && self.config.warning_ms > 0 && silent_ms >= self.config.warning_ms {
            self.warned = true;
            return Some(SilenceEvent::Warning { silent_ms });
        }
        None
    }

    pub fn status(&self) -> SilenceStatus {
        SilenceStatus {
            enabled: self.config.enabled,
            is_silent: self.silent_since.is_some(),
            silent_ms: self.silent_since.map_or(0, |s| self.last_update.saturating_sub(s)),
            warned: self.warned,
            timed_out: self.timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_clamped() {
        assert_eq!(FrameRateLimiter::new(120).stats().fps, MAX_FPS);
        assert_eq!(FrameRateLimiter::new(5).stats().fps, MIN_FPS);
    }

    #[test]
    fn frames_are_spaced_by_interval() {
        let mut limiter = FrameRateLimiter::new(45);
        let start = Instant::now();
        assert!(limiter.should_process(start));
        assert!(!limiter.should_process(start + Duration::from_millis(5)));
        assert!(limiter.should_process(start + Duration::from_millis(23)));
        assert_eq!(limiter.stats().frame_drops, 0);
    }

    #[test]
    fn repeated_late_frames_lower_the_rate_then_recover() {
        let mut limiter = FrameRateLimiter::new(45);
        let mut now = Instant::now();
        limiter.should_process(now);
        for _ in 0..6 {
            now += Duration::from_millis(100);
            assert!(limiter.should_process(now));
        }
        let stats = limiter.stats();
        assert_eq!(stats.fps, 40);
        assert_eq!(stats.frame_drops, 0);

        limiter.recover();
        assert_eq!(limiter.stats().fps, 45);
        limiter.recover();
        assert_eq!(limiter.stats().fps, 45);
    }

    fn silence(warning_ms: u64, timeout_ms: u64) -> SilenceTracker {
        SilenceTracker::new(SilenceConfig {
            enabled: true,
            warning_ms,
            timeout_ms,
            min_volume_threshold: 0.01,
        })
    }

    #[test]
    fn silence_warns_then_times_out() {
        let mut tracker = silence(100, 300);
        assert_eq!(tracker.update(0.0, 0), None);
        assert_eq!(tracker.update(0.0, 50), None);
        assert_eq!(tracker.update(0.0, 120), Some(SilenceEvent::Warning { silent_ms: 120 }));
        assert_eq!(tracker.update(0.0, 200), None);
        assert_eq!(tracker.update(0.0, 300), Some(SilenceEvent::Timeout { silent_ms: 300 }));
        assert!(tracker.status().timed_out);
    }

    #[test]
    fn voice_after_warning_recovers() {
        let mut tracker = silence(100, 0);
        tracker.update(0.0, 0);
        tracker.update(0.0, 150);
        assert_eq!(tracker.update(0.5, 160), Some(SilenceEvent::Recovered));
        assert!(!tracker.status().is_silent);
        // Short pauses never report.
        tracker.update(0.0, 200);
        assert_eq!(tracker.update(0.5, 220), None);
    }

    #[test]
    fn disabled_tracker_is_inert() {
        let mut tracker = SilenceTracker::new(SilenceConfig::default());
        assert_eq!(tracker.update(0.0, 1_000_000), None);
        assert!(!tracker.status().enabled);
    }
}
