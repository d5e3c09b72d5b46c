//! # Pitch Detector
//!
//! Turns a pair of analysis taps into a stream of [`PitchFrame`]s: RMS volume
//! from the unfiltered tap, McLeod pitch from the filtered tap, harmonic
//! correction against recent history, and note/cents from the corrected
//! frequency.
//!
//! The detection loop runs on its own thread at an adaptive frame rate.
//! Callbacks are invoked after the detector's internal lock has been released,
//! so they may call back into the detector (stop, destroy, analyze). They must
//! not register new callbacks. A panicking callback is logged and the loop
//! carries on.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::error::{TrainerError, TrainerResult};
use crate::filter::{FilterStatus, FilterUpdate};
use crate::harmonic::{HarmonicCorrector, HarmonicStats};
use crate::manager::{AudioManager, GraphState};
use crate::music::{frequency_to_note, NO_NOTE};
use crate::pitch::McLeodDetector;
use crate::tap::{AnalysisTap, TapReadError};
use crate::timing::{FrameRateLimiter, PerformanceStats, SilenceEvent, SilenceStatus, SilenceTracker};

static NEXT_DETECTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    Uninitialized,
    Initializing,
    Ready,
    Detecting,
    Error,
    Destroyed,
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorState::Uninitialized => "uninitialized",
            DetectorState::Initializing => "initializing",
            DetectorState::Ready => "ready",
            DetectorState::Detecting => "detecting",
            DetectorState::Error => "error",
            DetectorState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    /// Stable volume below the absolute floor; no estimation attempted.
    Silent,
    /// Audible, but no pitch passed the clarity and range checks.
    Unpitched,
    Pitched,
}

/// One detection cycle's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PitchFrame {
    /// Corrected frequency in Hz, 0 when there is no reliable pitch.
    pub frequency: f32,
    /// Estimator output before harmonic correction, 0 when none.
    pub raw_frequency: f32,
    /// Note name such as "C4", or "--" when there is no pitch.
    pub note: String,
    pub octave: Option<i32>,
    /// Signed deviation from `note` in cents.
    pub cents: Option<f32>,
    pub clarity: f32,
    /// Smoothed volume in [0, 1].
    pub volume: f32,
    pub raw_volume: f32,
    pub status: FrameStatus,
    pub harmonic_corrected: bool,
    /// Milliseconds since the detector was created.
    pub timestamp_ms: u64,
}

impl PitchFrame {
    pub fn is_pitched(&self) -> bool {
        self.status == FrameStatus::Pitched
    }
}

pub type PitchCallback = Box<dyn FnMut(&PitchFrame) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&TrainerError) + Send>;
pub type StateCallback = Box<dyn FnMut(DetectorState) + Send>;
pub type SilenceCallback = Box<dyn FnMut(SilenceEvent) + Send>;

#[derive(Default)]
pub struct DetectorCallbacks {
    pub on_pitch_update: Option<PitchCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_state_change: Option<StateCallback>,
    pub on_silence: Option<SilenceCallback>,
}

enum Event {
    Pitch(PitchFrame),
    Error(TrainerError),
    State(DetectorState),
    Silence(SilenceEvent),
}

struct Core {
    state: DetectorState,
    config: DetectorConfig,
    filtered: Option<AnalysisTap>,
    raw: Option<AnalysisTap>,
    estimator: Option<McLeodDetector>,
    corrector: HarmonicCorrector,
    limiter: FrameRateLimiter,
    silence: SilenceTracker,
    buffer: Vec<f32>,
    stable_volume: f32,
    latest: Option<PitchFrame>,
}

/// Outcome of one cycle that the caller has to act on.
enum Cycle {
    Frame(PitchFrame),
    /// Tap buffer briefly unavailable; nothing emitted.
    Skipped,
    Failed(TrainerError),
}

impl Core {
    fn set_state(&mut self, state: DetectorState, events: &mut Vec<Event>) {
        if self.state != state {
            debug!("[PITCH-DETECTOR] {} -> {}", self.state, state);
            self.state = state;
            events.push(Event::State(state));
        }
    }

    fn read(&mut self, tap: &AnalysisTap) -> Result<(), TapReadError> {
        tap.read_time_domain(&mut self.buffer)
    }

    fn run_cycle(&mut self, now_ms: u64, events: &mut Vec<Event>) -> Cycle {
        let (Some(filtered), Some(raw)) = (self.filtered.clone(), self.raw.clone()) else {
            return Cycle::Failed(TrainerError::AnalysisFailure("detector has no analysis taps".into()));
        };

        // Volume from the unfiltered tap; its samples already carry the
        // graph gain, so no second sensitivity scaling here.
        match self.read(&raw) {
            Ok(()) => {}
            Err(TapReadError::Busy) => return Cycle::Skipped,
            Err(TapReadError::Disposed) => {
                return Cycle::Failed(TrainerError::AnalysisFailure(format!("tap '{}' was disposed", raw.id())));
            }
        }
        let raw_volume = rms(&self.buffer).min(1.0);
        let alpha = self.config.volume_smoothing;
        self.stable_volume = (alpha * raw_volume + (1.0 - alpha) * self.stable_volume).clamp(0.0, 1.0);

        if let Some(event) = self.silence.update(self.stable_volume, now_ms) {
            events.push(Event::Silence(event));
        }

        let mut frame = PitchFrame {
            frequency: 0.0,
            raw_frequency: 0.0,
            note: NO_NOTE.to_string(),
            octave: None,
            cents: None,
            clarity: 0.0,
            volume: self.stable_volume,
            raw_volume,
            status: FrameStatus::Silent,
            harmonic_corrected: false,
            timestamp_ms: now_ms,
        };

        if self.stable_volume < self.config.min_volume_absolute {
            self.corrector.note_unvoiced(now_ms);
            return Cycle::Frame(frame);
        }

        match self.read(&filtered) {
            Ok(()) => {}
            Err(TapReadError::Busy) => return Cycle::Skipped,
            Err(TapReadError::Disposed) => {
                return Cycle::Failed(TrainerError::AnalysisFailure(format!(
                    "tap '{}' was disposed",
                    filtered.id()
                )));
            }
        }
        let sample_rate = filtered.sample_rate() as f32;
        let estimate = self
            .estimator
            .as_mut()
            .and_then(|estimator| estimator.detect(&self.buffer, sample_rate));

        frame.status = FrameStatus::Unpitched;
        let Some(estimate) = estimate else {
            self.corrector.note_unvoiced(now_ms);
            return Cycle::Frame(frame);
        };
        frame.raw_frequency = estimate.frequency;
        frame.clarity = estimate.clarity;

        let in_range = (self.config.min_frequency..=self.config.max_frequency).contains(&estimate.frequency);
        if estimate.clarity < self.config.clarity_threshold || !in_range {
            self.corrector.note_unvoiced(now_ms);
            return Cycle::Frame(frame);
        }

        let correction = self.corrector.correct(estimate.frequency, estimate.clarity, now_ms);
        frame.frequency = correction.frequency;
        frame.harmonic_corrected = correction.was_corrected();
        if let Some(note) = frequency_to_note(correction.frequency) {
            frame.note = note.name;
            frame.octave = Some(note.octave);
            frame.cents = Some(note.cents);
        }
        frame.status = FrameStatus::Pitched;
        Cycle::Frame(frame)
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

struct Shared {
    id: u64,
    manager: AudioManager,
    epoch: Instant,
    core: Mutex<Core>,
    callbacks: Mutex<DetectorCallbacks>,
    pending: Mutex<VecDeque<Event>>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Runs one cycle under the core lock and translates its outcome into
    /// events. A failure or silence timeout moves a running detector back to
    /// `ready`.
    fn cycle(&self, core: &mut Core, events: &mut Vec<Event>) -> (Option<PitchFrame>, Option<TrainerError>) {
        let now_ms = self.now_ms();
        match core.run_cycle(now_ms, events) {
            Cycle::Frame(frame) => {
                let timed_out = events
                    .iter()
                    .any(|e| matches!(e, Event::Silence(SilenceEvent::Timeout { .. })));
                if core.state == DetectorState::Detecting {
                    core.latest = Some(frame.clone());
                }
                events.push(Event::Pitch(frame.clone()));
                if timed_out && core.state == DetectorState::Detecting {
                    info!("[PITCH-DETECTOR] silence timeout, stopping detection");
                    core.latest = None;
                    core.set_state(DetectorState::Ready, events);
                }
                (Some(frame), None)
            }
            Cycle::Skipped => (None, None),
            Cycle::Failed(err) => {
                error!("[PITCH-DETECTOR] {}", err);
                events.push(Event::Error(err.clone()));
                if core.state == DetectorState::Detecting {
                    core.latest = None;
                    core.set_state(DetectorState::Ready, events);
                }
                (None, Some(err))
            }
        }
    }

    fn next_pending(&self) -> Option<Event> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    /// Queues `events` and delivers them in order. Whoever holds the callbacks
    /// drains the queue, including a callback on this thread re-entering the
    /// detector.
    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).extend(events);
        loop {
            let mut callbacks = match self.callbacks.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while let Some(event) = self.next_pending() {
                deliver(&mut callbacks, event);
            }
            drop(callbacks);
            if !self.has_pending() {
                return;
            }
        }
    }
}

fn deliver(callbacks: &mut DetectorCallbacks, event: Event) {
    let (name, outcome) = match event {
        Event::Pitch(frame) => (
            "pitch",
            callbacks.on_pitch_update.as_mut().map(|cb| catch_unwind(AssertUnwindSafe(|| cb(&frame)))),
        ),
        Event::Error(err) => (
            "error",
            callbacks.on_error.as_mut().map(|cb| catch_unwind(AssertUnwindSafe(|| cb(&err)))),
        ),
        Event::State(state) => (
            "state",
            callbacks.on_state_change.as_mut().map(|cb| catch_unwind(AssertUnwindSafe(|| cb(state)))),
        ),
        Event::Silence(event) => (
            "silence",
            callbacks.on_silence.as_mut().map(|cb| catch_unwind(AssertUnwindSafe(|| cb(event)))),
        ),
    };
    if let Some(Err(_)) = outcome {
        error!("[PITCH-DETECTOR] {} callback panicked; continuing", name);
    }
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Real-time pitch and volume detector bound to one [`AudioManager`].
pub struct PitchDetector {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl PitchDetector {
    pub fn new(manager: AudioManager, config: DetectorConfig) -> TrainerResult<Self> {
        config.validate()?;
        let core = Core {
            state: DetectorState::Uninitialized,
            corrector: HarmonicCorrector::new(config.harmonic.clone()),
            limiter: FrameRateLimiter::new(config.target_fps),
            silence: SilenceTracker::new(config.silence.clone()),
            buffer: vec![0.0; config.fft_size],
            filtered: None,
            raw: None,
            estimator: None,
            stable_volume: 0.0,
            latest: None,
            config,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_DETECTOR_ID.fetch_add(1, Ordering::Relaxed),
                manager,
                epoch: Instant::now(),
                core: Mutex::new(core),
                callbacks: Mutex::new(DetectorCallbacks::default()),
                pending: Mutex::new(VecDeque::new()),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn set_callbacks(&self, callbacks: DetectorCallbacks) {
        *self.shared.callbacks.lock().unwrap_or_else(|p| p.into_inner()) = callbacks;
    }

    pub fn on_pitch_update(&self, callback: impl FnMut(&PitchFrame) + Send + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|p| p.into_inner()).on_pitch_update = Some(Box::new(callback));
    }

    pub fn on_error(&self, callback: impl FnMut(&TrainerError) + Send + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|p| p.into_inner()).on_error = Some(Box::new(callback));
    }

    pub fn on_state_change(&self, callback: impl FnMut(DetectorState) + Send + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|p| p.into_inner()).on_state_change = Some(Box::new(callback));
    }

    pub fn on_silence(&self, callback: impl FnMut(SilenceEvent) + Send + 'static) {
        self.shared.callbacks.lock().unwrap_or_else(|p| p.into_inner()).on_silence = Some(Box::new(callback));
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> DetectorState {
        self.shared.core().state
    }

    pub fn config(&self) -> DetectorConfig {
        self.shared.core().config.clone()
    }

    /// Ids of the taps this detector registered, filtered first.
    pub fn tap_ids(&self) -> Vec<String> {
        let core = self.shared.core();
        core.filtered.iter().chain(core.raw.iter()).map(|t| t.id().to_string()).collect()
    }

    /// Registers the filtered (pitch) and raw (volume) taps on the manager's
    /// graph. The manager must already be acquired.
    pub fn initialize(&self) -> TrainerResult<()> {
        let mut events = Vec::new();
        let result = self.initialize_inner(&mut events);
        if let Err(err) = &result {
            if !matches!(err, TrainerError::Destroyed) {
                events.push(Event::Error(err.clone()));
            }
        }
        self.shared.dispatch(events);
        result
    }

    fn initialize_inner(&self, events: &mut Vec<Event>) -> TrainerResult<()> {
        let mut core = self.shared.core();
        match core.state {
            DetectorState::Destroyed => return Err(TrainerError::Destroyed),
            DetectorState::Ready | DetectorState::Detecting => return Ok(()),
            _ => {}
        }
        if self.shared.manager.state() != GraphState::Ready {
            return Err(TrainerError::NotReady("audio manager has not been acquired".into()));
        }
        core.set_state(DetectorState::Initializing, events);

        let filtered_id = format!("pitch-detector-filtered-{}", self.shared.id);
        let raw_id = format!("pitch-detector-raw-{}", self.shared.id);
        let filtered = self
            .shared
            .manager
            .create_analysis_tap(&filtered_id, core.config.tap_options(true));
        let raw = filtered.and_then(|filtered| {
            self.shared
                .manager
                .create_analysis_tap(&raw_id, core.config.tap_options(false))
                .map(|raw| (filtered, raw))
                .inspect_err(|_| self.shared.manager.remove_tap(&filtered_id))
        });

        match raw {
            Ok((filtered, raw)) => {
                info!(
                    "[PITCH-DETECTOR] initialized with taps '{}' and '{}' at {} Hz",
                    filtered.id(),
                    raw.id(),
                    filtered.sample_rate()
                );
                core.estimator = Some(McLeodDetector::new(core.config.fft_size));
                core.filtered = Some(filtered);
                core.raw = Some(raw);
                core.set_state(DetectorState::Ready, events);
                Ok(())
            }
            Err(err) => {
                warn!("[PITCH-DETECTOR] initialization failed: {}", err);
                core.set_state(DetectorState::Error, events);
                Err(err)
            }
        }
    }

    /// Starts the detection loop. Idempotent while detecting.
    pub fn start_detection(&self) -> TrainerResult<()> {
        match self.state() {
            DetectorState::Destroyed => return Err(TrainerError::Destroyed),
            DetectorState::Detecting => return Ok(()),
            DetectorState::Ready => {}
            other => return Err(TrainerError::NotReady(format!("cannot start detection while {other}"))),
        }
        // A loop that stopped itself (failure, silence timeout) may still be winding down.
        self.join_worker();

        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        let mut events = Vec::new();
        {
            let mut core = self.shared.core();
            match core.state {
                DetectorState::Ready => {}
                DetectorState::Detecting => return Ok(()),
                DetectorState::Destroyed => return Err(TrainerError::Destroyed),
                other => return Err(TrainerError::NotReady(format!("cannot start detection while {other}"))),
            }
            core.limiter.reset();
            core.silence.reset();
            core.set_state(DetectorState::Detecting, &mut events);
        }

        let (stop_tx, stop_rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("pitch-detector-{}", self.shared.id))
            .spawn(move || detection_loop(shared, stop_rx));
        match spawned {
            Ok(handle) => {
                let thread_id = handle.thread().id();
                *worker = Some(Worker { stop_tx, handle, thread_id });
                drop(worker);
                info!("[PITCH-DETECTOR] detection started");
                self.shared.dispatch(events);
                Ok(())
            }
            Err(e) => {
                drop(worker);
                let err = TrainerError::AnalysisFailure(format!("cannot spawn detection thread: {e}"));
                self.shared.core().set_state(DetectorState::Ready, &mut events);
                events.push(Event::Error(err.clone()));
                self.shared.dispatch(events);
                Err(err)
            }
        }
    }

    /// Stops the loop and returns to `ready`. Harmonic history is kept.
    pub fn stop_detection(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.shared.core();
            if core.state == DetectorState::Detecting {
                core.latest = None;
                core.set_state(DetectorState::Ready, &mut events);
            }
        }
        self.join_worker();
        if !events.is_empty() {
            info!("[PITCH-DETECTOR] detection stopped");
        }
        self.shared.dispatch(events);
    }

    fn join_worker(&self) {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.try_send(());
            // From inside a callback the loop is this very thread; it exits
            // on its own once the callback returns.
            if worker.thread_id != thread::current().id() && worker.handle.join().is_err() {
                error!("[PITCH-DETECTOR] detection thread panicked");
            }
        }
    }

    /// Releases the taps and enters the terminal `destroyed` state.
    pub fn destroy(&self) {
        self.stop_detection();
        let mut events = Vec::new();
        {
            let mut core = self.shared.core();
            if core.state == DetectorState::Destroyed {
                return;
            }
            for tap in core.filtered.take().into_iter().chain(core.raw.take()) {
                self.shared.manager.remove_tap(tap.id());
            }
            core.estimator = None;
            core.latest = None;
            core.corrector.clear();
            core.set_state(DetectorState::Destroyed, &mut events);
        }
        info!("[PITCH-DETECTOR] destroyed");
        self.shared.dispatch(events);
    }

    /// Runs one detection cycle immediately, outside the frame pacing.
    ///
    /// # Returns
    /// * `Ok(Some(frame))` - the cycle produced a frame (also sent to the callback)
    /// * `Ok(None)` - the tap buffer was busy; nothing was emitted
    /// * `Err(AnalysisFailure)` - a tap was disposed; a running loop is stopped
    pub fn analyze_now(&self) -> TrainerResult<Option<PitchFrame>> {
        let mut events = Vec::new();
        let (frame, failure) = {
            let mut core = self.shared.core();
            match core.state {
                DetectorState::Destroyed => return Err(TrainerError::Destroyed),
                DetectorState::Ready | DetectorState::Detecting => {}
                other => return Err(TrainerError::NotReady(format!("cannot analyze while {other}"))),
            }
            self.shared.cycle(&mut core, &mut events)
        };
        let stopped = events.iter().any(|e| matches!(e, Event::State(DetectorState::Ready)));
        self.shared.dispatch(events);
        if stopped {
            self.join_worker();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(frame),
        }
    }

    /// Latest frame of the running loop; `None` unless detecting.
    pub fn latest_result(&self) -> Option<PitchFrame> {
        let core = self.shared.core();
        if core.state == DetectorState::Detecting {
            core.latest.clone()
        } else {
            None
        }
    }

    /// Enables or disables octave correction. Disabling forgets the history.
    pub fn set_harmonic_correction_enabled(&self, enabled: bool) {
        self.shared.core().corrector.set_enabled(enabled);
        debug!("[PITCH-DETECTOR] harmonic correction {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn harmonic_stats(&self) -> HarmonicStats {
        self.shared.core().corrector.stats()
    }

    /// Clears the smoothed volume, latest frame and harmonic history.
    pub fn reset_display_state(&self) {
        let mut core = self.shared.core();
        core.stable_volume = 0.0;
        core.latest = None;
        core.corrector.clear();
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.shared.core().limiter.stats()
    }

    pub fn silence_status(&self) -> SilenceStatus {
        self.shared.core().silence.status()
    }

    pub fn filter_status(&self) -> Option<FilterStatus> {
        self.shared.core().filtered.as_ref().and_then(AnalysisTap::filter_status)
    }

    pub fn update_filter(&self, update: FilterUpdate) -> TrainerResult<()> {
        match self.shared.core().filtered.as_ref() {
            Some(tap) => tap.update_filter(update),
            None => Err(TrainerError::NotReady("detector is not initialized".into())),
        }
    }

    pub fn set_filter_enabled(&self, enabled: bool) {
        if let Some(tap) = self.shared.core().filtered.as_ref() {
            tap.set_filter_enabled(enabled);
        }
    }
}

impl Drop for PitchDetector {
    fn drop(&mut self) {
        self.join_worker();
        let mut core = self.shared.core();
        if core.state == DetectorState::Destroyed {
            return;
        }
        for tap in core.filtered.take().into_iter().chain(core.raw.take()) {
            debug!("[PITCH-DETECTOR] dropped without destroy, removing tap '{}'", tap.id());
            self.shared.manager.remove_tap(tap.id());
        }
    }
}

impl fmt::Debug for PitchDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchDetector")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

fn detection_loop(shared: Arc<Shared>, stop_rx: Receiver<()>) {
    debug!("[PITCH-DETECTOR] loop thread started");
    loop {
        let wait = shared.core().limiter.time_until_next(Instant::now());
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            default(wait) => {},
        }

        let mut events = Vec::new();
        {
            let mut core = shared.core();
            if core.state != DetectorState::Detecting {
                break;
            }
            if !core.limiter.should_process(Instant::now()) {
                continue;
            }
            let (frame, _) = shared.cycle(&mut core, &mut events);
            if frame.is_some() && core.limiter.stats().frame_drops == 0 {
                core.limiter.recover();
            }
        }
        let keep_running = !events.iter().any(|e| matches!(e, Event::State(DetectorState::Ready)));
        shared.dispatch(events);
        if !keep_running {
            break;
        }
    }
    debug!("[PITCH-DETECTOR] loop thread finished");
}
