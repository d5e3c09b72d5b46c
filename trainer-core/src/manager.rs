//! Reference-counted owner of the single capture stream.
//!
//! Consumers call [`AudioManager::acquire`] before registering taps and
//! [`AudioManager::release`] when done. The first acquisition opens the
//! device; concurrent acquisitions wait on that one attempt instead of
//! prompting again; the last release tears the stream down.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::{CaptureBackend, CaptureStream, GraphInput, StreamHealth};
use crate::config::{CaptureConfig, TapOptions};
use crate::device::device_specs;
use crate::error::{TrainerError, TrainerResult};
use crate::tap::{AnalysisTap, AudioGraph};

pub const MIN_SENSITIVITY: f32 = 0.1;
pub const MAX_SENSITIVITY: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
}

/// What a successful acquisition hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioGraphHandle {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Acquisition cycle this handle belongs to; bumps on every re-open.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub state: GraphState,
    /// `None` when no stream is open.
    pub stream: Option<StreamHealth>,
    pub healthy: bool,
    pub ref_count: usize,
    pub tap_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub state: GraphState,
    pub ref_count: usize,
    pub sensitivity: f32,
    pub tap_ids: Vec<String>,
    pub filtered_tap_ids: Vec<String>,
    pub sample_rate: Option<u32>,
    pub last_error: Option<String>,
}

struct Inner {
    state: GraphState,
    ref_count: usize,
    stream: Option<Box<dyn CaptureStream>>,
    graph: Option<Arc<AudioGraph>>,
    sensitivity: f32,
    /// Incremented at the start of every open attempt.
    attempt: u64,
    last_error: Option<TrainerError>,
}

struct Shared {
    backend: Box<dyn CaptureBackend>,
    capture: CaptureConfig,
    default_sensitivity: f32,
    inner: Mutex<Inner>,
    settled: Condvar,
}

/// Cloneable handle to the shared capture resource.
#[derive(Clone)]
pub struct AudioManager {
    shared: Arc<Shared>,
}

impl AudioManager {
    /// Manager whose default gain comes from the detected device specs.
    pub fn new(backend: impl CaptureBackend + 'static, capture: CaptureConfig) -> Self {
        Self::with_default_sensitivity(backend, capture, device_specs().sensitivity_multiplier)
    }

    pub fn with_default_sensitivity(
        backend: impl CaptureBackend + 'static,
        capture: CaptureConfig,
        sensitivity: f32,
    ) -> Self {
        let sensitivity = clamp_sensitivity(sensitivity);
        Self {
            shared: Arc::new(Shared {
                backend: Box::new(backend),
                capture,
                default_sensitivity: sensitivity,
                inner: Mutex::new(Inner {
                    state: GraphState::Uninitialized,
                    ref_count: 0,
                    stream: None,
                    graph: None,
                    sensitivity,
                    attempt: 0,
                    last_error: None,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens the capture stream on first use and takes one reference.
    ///
    /// Callers arriving while an open is in flight wait for it and share its
    /// outcome. A ready but unhealthy stream is torn down and reopened once.
    pub fn acquire(&self) -> TrainerResult<AudioGraphHandle> {
        let mut inner = self.lock();
        loop {
            match inner.state {
                GraphState::Ready => {
                    let healthy = inner.stream.as_ref().is_some_and(|s| s.health().is_healthy());
                    if healthy {
                        inner.ref_count += 1;
                        debug!("[AUDIO-MANAGER] acquired, ref_count={}", inner.ref_count);
                        return Ok(handle_of(&inner));
                    }
                    warn!("[AUDIO-MANAGER] capture stream unhealthy, reinitializing");
                    teardown(&mut inner);
                    inner.state = GraphState::Uninitialized;
                }
                GraphState::Initializing => {
                    let attempt = inner.attempt;
                    inner = self
                        .shared
                        .settled
                        .wait_while(inner, |i| i.state == GraphState::Initializing && i.attempt == attempt)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if inner.attempt == attempt && inner.state == GraphState::Error {
                        return Err(inner
                            .last_error
                            .clone()
                            .unwrap_or_else(|| TrainerError::DeviceInitFailed("initialization failed".into())));
                    }
                }
                GraphState::Uninitialized | GraphState::Error => {
                    // A failed recovery leaves its graph behind.
                    teardown(&mut inner);
                    inner.state = GraphState::Initializing;
                    inner.attempt += 1;
                    let attempt = inner.attempt;
                    let graph = Arc::new(AudioGraph::new(self.shared.capture.sample_rate, inner.sensitivity));
                    drop(inner);

                    info!("[AUDIO-MANAGER] opening capture stream (attempt {})", attempt);
                    let opened = self
                        .shared
                        .backend
                        .open(&self.shared.capture, GraphInput::new(Arc::clone(&graph)));

                    let mut relocked = self.lock();
                    let result = match opened {
                        Ok(stream) => {
                            graph.set_sample_rate(stream.sample_rate());
                            info!(
                                "[AUDIO-MANAGER] capture ready: {} Hz, {} channel(s)",
                                stream.sample_rate(),
                                stream.channel_count()
                            );
                            relocked.stream = Some(stream);
                            relocked.graph = Some(graph);
                            relocked.state = GraphState::Ready;
                            relocked.last_error = None;
                            relocked.ref_count += 1;
                            Ok(handle_of(&relocked))
                        }
                        Err(e) => {
                            warn!("[AUDIO-MANAGER] capture open failed: {}", e);
                            relocked.state = GraphState::Error;
                            relocked.last_error = Some(e.clone());
                            Err(e)
                        }
                    };
                    drop(relocked);
                    self.shared.settled.notify_all();
                    return result;
                }
            }
        }
    }

    /// Reopens an unhealthy stream in place. Unlike the reopen inside
    /// [`acquire`](Self::acquire), the graph and its taps survive, and the
    /// reference count is left alone.
    ///
    /// # Returns
    /// * `Ok(handle)` - the stream is healthy (reopened or already fine)
    /// * `Err(NotReady)` - nobody holds a reference, or an open is in flight
    /// * `Err(_)` - the backend failed to reopen; the manager is left in `error`
    pub fn recover(&self) -> TrainerResult<AudioGraphHandle> {
        let mut inner = self.lock();
        if inner.ref_count == 0 {
            return Err(TrainerError::NotReady("no outstanding references to recover".into()));
        }
        match inner.state {
            GraphState::Ready if inner.stream.as_ref().is_some_and(|s| s.health().is_healthy()) => {
                return Ok(handle_of(&inner));
            }
            GraphState::Initializing => {
                return Err(TrainerError::NotReady("capture stream is already being opened".into()));
            }
            _ => {}
        }
        let Some(graph) = inner.graph.clone() else {
            return Err(TrainerError::NotReady("no audio graph to recover".into()));
        };
        if let Some(mut stream) = inner.stream.take() {
            stream.close();
        }
        inner.state = GraphState::Initializing;
        inner.attempt += 1;
        let attempt = inner.attempt;
        drop(inner);

        info!("[AUDIO-MANAGER] recovering capture stream (attempt {})", attempt);
        let opened = self
            .shared
            .backend
            .open(&self.shared.capture, GraphInput::new(Arc::clone(&graph)));

        let mut relocked = self.lock();
        // A final release or forced cleanup may have run meanwhile.
        let still_wanted = relocked.graph.as_ref().is_some_and(|g| Arc::ptr_eq(g, &graph));
        let result = match opened {
            Ok(mut stream) if !still_wanted => {
                stream.close();
                Err(TrainerError::NotReady("audio graph was torn down during recovery".into()))
            }
            Ok(stream) => {
                graph.set_sample_rate(stream.sample_rate());
                info!("[AUDIO-MANAGER] capture stream recovered: {} Hz", stream.sample_rate());
                relocked.stream = Some(stream);
                relocked.state = GraphState::Ready;
                relocked.last_error = None;
                Ok(handle_of(&relocked))
            }
            Err(e) => {
                warn!("[AUDIO-MANAGER] recovery failed: {}", e);
                if still_wanted {
                    relocked.state = GraphState::Error;
                    relocked.last_error = Some(e.clone());
                }
                Err(e)
            }
        };
        if !still_wanted && relocked.state == GraphState::Initializing && relocked.attempt == attempt {
            relocked.state = GraphState::Uninitialized;
        }
        drop(relocked);
        self.shared.settled.notify_all();
        result
    }

    /// Registers a tap on the live graph.
    pub fn create_analysis_tap(&self, id: &str, options: TapOptions) -> TrainerResult<AnalysisTap> {
        let inner = self.lock();
        let graph = ready_graph(&inner)?;
        let tap = graph.add_tap(id, options)?;
        debug!(
            "[AUDIO-MANAGER] tap '{}' created (fft {}, filtered {})",
            id,
            tap.fft_size(),
            tap.options().use_filters
        );
        Ok(tap)
    }

    /// Detaches and disposes a tap. Unknown ids are ignored.
    pub fn remove_tap(&self, id: &str) {
        let inner = self.lock();
        if let Some(graph) = inner.graph.as_ref() {
            if graph.remove_tap(id) {
                debug!("[AUDIO-MANAGER] tap '{}' removed", id);
            }
        }
    }

    /// Sets the gain, clamped to `[0.1, 10.0]`. Returns the applied value.
    pub fn set_sensitivity(&self, multiplier: f32) -> f32 {
        let applied = clamp_sensitivity(multiplier);
        let mut inner = self.lock();
        inner.sensitivity = applied;
        if let Some(graph) = inner.graph.as_ref() {
            graph.set_gain(applied);
        }
        if applied != multiplier {
            debug!("[AUDIO-MANAGER] sensitivity {} clamped to {}", multiplier, applied);
        }
        applied
    }

    pub fn sensitivity(&self) -> f32 {
        self.lock().sensitivity
    }

    /// Drops one reference and disposes `tap_ids`. The last reference tears
    /// the stream down. Extra calls are harmless.
    pub fn release<S: AsRef<str>>(&self, tap_ids: &[S]) {
        let mut inner = self.lock();
        if let Some(graph) = inner.graph.as_ref() {
            for id in tap_ids {
                graph.remove_tap(id.as_ref());
            }
        }
        if inner.ref_count == 0 {
            debug!("[AUDIO-MANAGER] release with no outstanding references ignored");
            return;
        }
        inner.ref_count -= 1;
        debug!("[AUDIO-MANAGER] released, ref_count={}", inner.ref_count);
        if inner.ref_count == 0 {
            teardown(&mut inner);
            inner.state = GraphState::Uninitialized;
            inner.sensitivity = self.shared.default_sensitivity;
        }
    }

    /// Tears everything down regardless of outstanding references.
    pub fn force_cleanup(&self) {
        let mut inner = self.lock();
        warn!("[AUDIO-MANAGER] forced cleanup with ref_count={}", inner.ref_count);
        teardown(&mut inner);
        inner.ref_count = 0;
        if inner.state != GraphState::Initializing {
            inner.state = GraphState::Uninitialized;
        }
        inner.sensitivity = self.shared.default_sensitivity;
    }

    pub fn check_health(&self) -> HealthStatus {
        let inner = self.lock();
        let stream = inner.stream.as_ref().map(|s| s.health());
        HealthStatus {
            state: inner.state,
            stream,
            healthy: inner.state == GraphState::Ready && stream.is_some_and(StreamHealth::is_healthy),
            ref_count: inner.ref_count,
            tap_count: inner.graph.as_ref().map_or(0, |g| g.tap_ids().0.len()),
        }
    }

    pub fn status(&self) -> ManagerStatus {
        let inner = self.lock();
        let (tap_ids, filtered_tap_ids) = inner.graph.as_ref().map(|g| g.tap_ids()).unwrap_or_default();
        ManagerStatus {
            state: inner.state,
            ref_count: inner.ref_count,
            sensitivity: inner.sensitivity,
            tap_ids,
            filtered_tap_ids,
            sample_rate: inner.stream.as_ref().map(|s| s.sample_rate()),
            last_error: inner.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    pub fn state(&self) -> GraphState {
        self.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.lock().ref_count
    }

    pub fn default_sensitivity(&self) -> f32 {
        self.shared.default_sensitivity
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        teardown(inner);
    }
}

fn clamp_sensitivity(multiplier: f32) -> f32 {
    if multiplier.is_nan() {
        return MIN_SENSITIVITY;
    }
    multiplier.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
}

fn handle_of(inner: &Inner) -> AudioGraphHandle {
    let (sample_rate, channel_count) = inner
        .stream
        .as_ref()
        .map_or((0, 0), |s| (s.sample_rate(), s.channel_count()));
    AudioGraphHandle {
        sample_rate,
        channel_count,
        generation: inner.attempt,
    }
}

fn ready_graph(inner: &Inner) -> TrainerResult<&Arc<AudioGraph>> {
    match (inner.state, inner.graph.as_ref()) {
        (GraphState::Ready, Some(graph)) => Ok(graph),
        (state, _) => Err(TrainerError::NotReady(format!(
            "audio graph is {:?}; call acquire() first",
            state
        ))),
    }
}

/// Closes the stream and disposes every tap. Leaves `state` to the caller.
fn teardown(inner: &mut Inner) {
    if let Some(graph) = inner.graph.take() {
        graph.dispose_all();
    }
    if let Some(mut stream) = inner.stream.take() {
        stream.close();
        info!("[AUDIO-MANAGER] capture stream closed");
    }
}
