//! # Audio Capture Module
//!
//! This module reaches the microphone through the [`CaptureBackend`]
//! capability and pushes captured blocks into the shared processing graph.
//!
//! ## Backends
//! - [`CpalBackend`]: default input device via CPAL (Cross-Platform Audio
//!   Library), downmixed to mono f32
//! - [`ManualBackend`]: programmable in-process source for tests and
//!   synthetic input; counts permission prompts and can simulate failures

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use crossbeam_channel::{bounded, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::{TrainerError, TrainerResult};
use crate::tap::AudioGraph;

/// Samples per block handed from the device callback to the graph pump.
///
/// Small blocks keep tap buffers fresh; the taps themselves hold `fft_size`.
pub const BLOCK_SIZE: usize = 512;

/// Liveness of an open capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamHealth {
    Live,
    /// The track stopped (device unplugged, permission revoked, stream error).
    Ended,
    /// The track is open but delivers silence by host decision.
    Muted,
}

impl StreamHealth {
    pub fn is_healthy(self) -> bool {
        self == StreamHealth::Live
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamHealth::Live,
            1 => StreamHealth::Ended,
            _ => StreamHealth::Muted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamHealth::Live => 0,
            StreamHealth::Ended => 1,
            StreamHealth::Muted => 2,
        }
    }
}

/// Health shared between a stream handle and whatever drives it.
#[derive(Debug, Clone)]
struct HealthFlag(Arc<AtomicU8>);

impl HealthFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(StreamHealth::Live.as_u8())))
    }

    fn get(&self) -> StreamHealth {
        StreamHealth::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, health: StreamHealth) {
        self.0.store(health.as_u8(), Ordering::Release);
    }
}

/// Entry point of the processing graph handed to a backend on open.
#[derive(Clone)]
pub struct GraphInput {
    graph: Arc<AudioGraph>,
}

impl GraphInput {
    pub(crate) fn new(graph: Arc<AudioGraph>) -> Self {
        Self { graph }
    }

    /// Feeds one block of mono samples through the gain stage into every tap.
    pub fn push(&self, samples: &[f32]) {
        self.graph.ingest(samples);
    }

    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }
}

/// A running capture stream.
pub trait CaptureStream: Send {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u16;
    fn health(&self) -> StreamHealth;
    /// Stops delivery. Must be idempotent.
    fn close(&mut self);
}

/// Capability that opens the microphone.
///
/// One `open` call corresponds to one permission prompt on hosts that have
/// them. The stream may run at a different rate than requested; callers read
/// the actual rate from the returned stream.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, config: &CaptureConfig, input: GraphInput) -> TrainerResult<Box<dyn CaptureStream>>;
}

// ---------------------------------------------------------------------------
// CPAL
// ---------------------------------------------------------------------------

/// Default input device via CPAL.
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

struct CpalStream {
    sample_rate: u32,
    channels: u16,
    health: HealthFlag,
    shutdown_tx: Option<Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CaptureStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn health(&self) -> StreamHealth {
        self.health.get()
    }

    fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("[AUDIO-THREAD] capture thread panicked");
            }
        }
        self.health.set(StreamHealth::Ended);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl CaptureBackend for CpalBackend {
    fn open(&self, config: &CaptureConfig, input: GraphInput) -> TrainerResult<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = bounded::<TrainerResult<(u32, u16)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let health = HealthFlag::new();
        let thread_health = health.clone();
        let config = config.clone();

        // cpal::Stream is not Send, so the thread that builds it owns it for
        // its whole life and doubles as the graph pump.
        let thread_handle = thread::Builder::new()
            .name("trainer-capture".into())
            .spawn(move || {
                debug!("[AUDIO-THREAD] starting capture thread");
                let (block_tx, block_rx) = bounded::<Vec<f32>>(32);
                let (stream, sample_rate, channels) =
                    match start_audio_capture(&config, block_tx, thread_health.clone()) {
                        Ok(started) => started,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok((sample_rate, channels)));

                loop {
                    crossbeam_channel::select! {
                        recv(block_rx) -> msg => match msg {
                            Ok(block) => input.push(&block),
                            Err(_) => {
                                warn!("[AUDIO-THREAD] audio channel closed");
                                thread_health.set(StreamHealth::Ended);
                                break;
                            }
                        },
                        recv(shutdown_rx) -> _ => {
                            debug!("[AUDIO-THREAD] received shutdown signal");
                            break;
                        },
                    }
                }

                if let Err(e) = stream.pause() {
                    warn!("[AUDIO-THREAD] error pausing stream: {}", e);
                }
                drop(stream);
                debug!("[AUDIO-THREAD] capture thread finished");
            })
            .map_err(|e| TrainerError::DeviceInitFailed(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok((sample_rate, channels))) => Ok(Box::new(CpalStream {
                sample_rate,
                channels,
                health,
                shutdown_tx: Some(shutdown_tx),
                thread_handle: Some(thread_handle),
            })),
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                Err(e)
            }
            Err(_) => Err(TrainerError::DeviceInitFailed("capture thread exited during setup".into())),
        }
    }
}

fn default_input_device() -> TrainerResult<cpal::Device> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| TrainerError::DeviceUnavailable("no input device available".into()))
}

/// Opens the default input device, frames its samples into mono blocks of
/// [`BLOCK_SIZE`] and sends them over `sender` without ever blocking the
/// device callback.
fn start_audio_capture(
    config: &CaptureConfig,
    sender: Sender<Vec<f32>>,
    health: HealthFlag,
) -> TrainerResult<(cpal::Stream, u32, u16)> {
    let device = default_input_device()?;
    build_stream(&device, config, sender, health).map_err(|e| {
        let unavailable = e
            .downcast_ref::<cpal::BuildStreamError>()
            .is_some_and(|b| matches!(b, cpal::BuildStreamError::DeviceNotAvailable));
        if unavailable {
            TrainerError::DeviceUnavailable(format!("{e:#}"))
        } else {
            TrainerError::DeviceInitFailed(format!("{e:#}"))
        }
    })
}

fn build_stream(
    device: &cpal::Device,
    config: &CaptureConfig,
    sender: Sender<Vec<f32>>,
    health: HealthFlag,
) -> Result<(cpal::Stream, u32, u16)> {
    info!("Using audio input device: {}", device.name().unwrap_or_else(|_| "<unnamed>".into()));

    let configs = device
        .supported_input_configs()
        .context("querying supported input configs")?
        .collect::<Vec<_>>();
    let supported = find_supported_config(configs, config.sample_rate, config.channel_count)
        .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

    let sample_rate = clamp_rate(&supported, config.sample_rate);
    let stream_config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(sample_rate)).into();
    let channels = stream_config.channels.max(1);
    info!("Selected sample rate: {} Hz, {} channel(s)", sample_rate, channels);

    let err_fn = move |err: cpal::StreamError| {
        error!("An error occurred on the audio stream: {}", err);
        health.set(StreamHealth::Ended);
    };

    // This buffer accumulates mono audio data from the callback.
    let mut audio_buffer: Vec<f32> = Vec::with_capacity(BLOCK_SIZE * 2);
    let frame_width = channels as usize;

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if frame_width == 1 {
                    audio_buffer.extend_from_slice(data);
                } else {
                    audio_buffer.extend(
                        data.chunks_exact(frame_width)
                            .map(|frame| frame.iter().sum::<f32>() / frame_width as f32),
                    );
                }
                while audio_buffer.len() >= BLOCK_SIZE {
                    // Dropping a block when the pump lags is fine; taps only
                    // keep the newest window anyway.
                    let _ = sender.try_send(audio_buffer[..BLOCK_SIZE].to_vec());
                    audio_buffer.drain(..BLOCK_SIZE);
                }
            },
            err_fn,
            None,
        )
        .context("building input stream")?;

    stream.play().context("starting input stream")?;
    Ok((stream, sample_rate, channels))
}

fn clamp_rate(config: &SupportedStreamConfigRange, target_rate: u32) -> u32 {
    target_rate.clamp(config.min_sample_rate().0, config.max_sample_rate().0)
}

/// Finds the best supported f32 configuration: the requested channel count
/// if available (otherwise the fewest channels), then the closest sample rate.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
    channels: u16,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let channel_penalty = if c.channels() == channels { 0 } else { c.channels() as i64 };
            let rate = target_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0);
            let rate_diff = (rate as i64 - target_rate as i64).abs();
            (channel_penalty, rate_diff)
        })
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManualBehavior {
    permission_denied: bool,
    fail_next: Option<String>,
    open_delay: Duration,
}

struct ManualShared {
    sample_rate: u32,
    opens: AtomicUsize,
    closes: AtomicUsize,
    behavior: Mutex<ManualBehavior>,
    current: Mutex<Option<ManualFeed>>,
}

/// In-process capture source.
///
/// Each successful `open` creates a new track whose [`ManualFeed`] pushes
/// samples synchronously into the graph.
#[derive(Clone)]
pub struct ManualBackend {
    shared: Arc<ManualShared>,
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new(44100)
    }
}

impl ManualBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(ManualShared {
                sample_rate,
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                behavior: Mutex::new(ManualBehavior::default()),
                current: Mutex::new(None),
            }),
        }
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, ManualBehavior> {
        self.shared.behavior.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// While set, every `open` fails with `DeviceUnavailable`.
    pub fn set_permission_denied(&self, denied: bool) {
        self.behavior().permission_denied = denied;
    }

    /// The next `open` fails with `DeviceInitFailed(message)`.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.behavior().fail_next = Some(message.into());
    }

    /// Simulates a slow permission prompt.
    pub fn set_open_delay(&self, delay: Duration) {
        self.behavior().open_delay = delay;
    }

    /// Number of `open` calls, i.e. permission prompts shown.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of streams closed.
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Feed of the most recently opened track, if it is still open.
    pub fn feed(&self) -> Option<ManualFeed> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .filter(|feed| feed.health() != StreamHealth::Ended)
    }
}

impl CaptureBackend for ManualBackend {
    fn open(&self, _config: &CaptureConfig, input: GraphInput) -> TrainerResult<Box<dyn CaptureStream>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let (delay, denied, failure) = {
            let mut behavior = self.behavior();
            (behavior.open_delay, behavior.permission_denied, behavior.fail_next.take())
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if denied {
            return Err(TrainerError::DeviceUnavailable("permission denied".into()));
        }
        if let Some(message) = failure {
            return Err(TrainerError::DeviceInitFailed(message));
        }

        let feed = ManualFeed {
            input,
            health: HealthFlag::new(),
            sample_rate: self.shared.sample_rate,
            phase: Arc::new(Mutex::new(0.0)),
        };
        *self.shared.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(feed.clone());
        Ok(Box::new(ManualStream {
            feed,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct ManualStream {
    feed: ManualFeed,
    shared: Arc<ManualShared>,
    closed: bool,
}

impl CaptureStream for ManualStream {
    fn sample_rate(&self) -> u32 {
        self.feed.sample_rate
    }

    fn channel_count(&self) -> u16 {
        1
    }

    fn health(&self) -> StreamHealth {
        self.feed.health()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.feed.health.set(StreamHealth::Ended);
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer side of a manual track.
#[derive(Clone)]
pub struct ManualFeed {
    input: GraphInput,
    health: HealthFlag,
    sample_rate: u32,
    phase: Arc<Mutex<f64>>,
}

impl ManualFeed {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn health(&self) -> StreamHealth {
        self.health.get()
    }

    /// Pushes samples unless the track has ended.
    pub fn push(&self, samples: &[f32]) {
        if self.health() != StreamHealth::Ended {
            self.input.push(samples);
        }
    }

    /// Pushes `len` samples of a sine tone, continuing the phase of the
    /// previous call so consecutive blocks join seamlessly.
    pub fn push_tone(&self, frequency: f32, amplitude: f32, len: usize) {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        let step = 2.0 * std::f64::consts::PI * frequency as f64 / self.sample_rate as f64;
        let block: Vec<f32> = (0..len)
            .map(|_| {
                let s = amplitude * phase.sin() as f32;
                *phase = (*phase + step) % (2.0 * std::f64::consts::PI);
                s
            })
            .collect();
        drop(phase);
        self.push(&block);
    }

    pub fn push_silence(&self, len: usize) {
        self.push(&vec![0.0; len]);
    }

    /// Simulates the host ending the track (device unplugged, permission revoked).
    pub fn end_track(&self) {
        self.health.set(StreamHealth::Ended);
    }

    pub fn set_muted(&self, muted: bool) {
        if self.health() != StreamHealth::Ended {
            self.health.set(if muted { StreamHealth::Muted } else { StreamHealth::Live });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TapOptions;

    fn graph_input() -> (GraphInput, Arc<AudioGraph>) {
        let graph = Arc::new(AudioGraph::new(44100, 1.0));
        (GraphInput::new(Arc::clone(&graph)), graph)
    }

    #[test]
    fn manual_open_counts_prompts_and_exposes_feed() {
        let backend = ManualBackend::new(48000);
        let (input, _graph) = graph_input();
        let stream = backend.open(&CaptureConfig::default(), input).unwrap();
        assert_eq!(backend.open_count(), 1);
        assert_eq!(stream.sample_rate(), 48000);
        assert_eq!(stream.health(), StreamHealth::Live);
        assert!(backend.feed().is_some());
    }

    #[test]
    fn denied_permission_is_device_unavailable() {
        let backend = ManualBackend::default();
        backend.set_permission_denied(true);
        let (input, _graph) = graph_input();
        let err = backend.open(&CaptureConfig::default(), input).err().unwrap();
        assert!(matches!(err, TrainerError::DeviceUnavailable(_)));
        assert_eq!(backend.open_count(), 1);
    }

    #[test]
    fn injected_failure_applies_once() {
        let backend = ManualBackend::default();
        backend.fail_next_open("driver crashed");
        let (input, _graph) = graph_input();
        let err = backend.open(&CaptureConfig::default(), input.clone()).err().unwrap();
        assert_eq!(err, TrainerError::DeviceInitFailed("driver crashed".into()));
        assert!(backend.open(&CaptureConfig::default(), input).is_ok());
    }

    #[test]
    fn closing_ends_the_track_and_stops_delivery() {
        let backend = ManualBackend::default();
        let (input, graph) = graph_input();
        let tap = graph
            .add_tap("t", TapOptions { fft_size: 32, use_filters: false, ..TapOptions::default() })
            .unwrap();
        let mut stream = backend.open(&CaptureConfig::default(), input).unwrap();
        let feed = backend.feed().unwrap();
        stream.close();
        stream.close();
        assert_eq!(backend.close_count(), 1);
        assert_eq!(stream.health(), StreamHealth::Ended);
        assert!(backend.feed().is_none());

        feed.push(&[1.0; 32]);
        let mut out = vec![0.0; 32];
        tap.read_time_domain(&mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn tone_blocks_are_phase_continuous() {
        let backend = ManualBackend::new(8000);
        let (input, graph) = graph_input();
        let tap = graph
            .add_tap("t", TapOptions { fft_size: 64, use_filters: false, ..TapOptions::default() })
            .unwrap();
        let _stream = backend.open(&CaptureConfig::default(), input).unwrap();
        let feed = backend.feed().unwrap();
        feed.push_tone(1000.0, 1.0, 10);
        feed.push_tone(1000.0, 1.0, 54);
        let mut out = vec![0.0; 64];
        tap.read_time_domain(&mut out).unwrap();
        // 8 samples per cycle at 1 kHz / 8 kHz.
        for i in 0..56 {
            assert!((out[i] - out[i + 8]).abs() < 1e-4);
        }
    }

    #[test]
    fn muting_is_reported_until_the_track_ends() {
        let backend = ManualBackend::default();
        let (input, _graph) = graph_input();
        let stream = backend.open(&CaptureConfig::default(), input).unwrap();
        let feed = backend.feed().unwrap();
        feed.set_muted(true);
        assert_eq!(stream.health(), StreamHealth::Muted);
        feed.end_track();
        feed.set_muted(false);
        assert_eq!(stream.health(), StreamHealth::Ended);
    }
}
