//! Periodic capture health checks with bounded automatic recovery.
//!
//! A [`HealthMonitor`] owns one background thread that polls
//! [`AudioManager::check_health`] on a fixed interval. While the manager holds
//! references and the stream has ended (device unplugged, permission revoked),
//! it waits `recovery_delay_ms` and calls [`AudioManager::recover`], which
//! reopens the device in place so existing taps and detectors keep running.
//! After `max_recovery_attempts` failures it reports [`HealthEvent::GaveUp`]
//! once and stays quiet until the manager goes idle, which restores the budget.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::HealthMonitorConfig;
use crate::error::{TrainerError, TrainerResult};
use crate::manager::{AudioManager, HealthStatus};

/// What the monitor reports to its callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A check found the stream unhealthy.
    Unhealthy(HealthStatus),
    RecoveryStarted { attempt: u32, max_attempts: u32 },
    Recovered { attempt: u32 },
    RecoveryFailed { attempt: u32, error: TrainerError },
    /// The attempt budget is spent; manual intervention is needed.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub checks: u64,
    pub unhealthy_checks: u64,
    pub recovery_attempts: u32,
    pub recoveries: u32,
    pub failed_recoveries: u32,
}

type EventCallback = Box<dyn FnMut(&HealthEvent) + Send>;

/// Handle to the monitoring thread. Dropping it stops the thread.
pub struct HealthMonitor {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<MonitorStats>>,
}

impl HealthMonitor {
    /// Starts watching `manager`. The callback runs on the monitor thread;
    /// a panic inside it is logged and swallowed.
    pub fn start(
        manager: AudioManager,
        config: HealthMonitorConfig,
        on_event: impl FnMut(&HealthEvent) + Send + 'static,
    ) -> TrainerResult<Self> {
        config.validate()?;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stats = Arc::new(Mutex::new(MonitorStats::default()));
        let watcher = Watcher {
            manager,
            interval: Duration::from_millis(config.interval_ms),
            recovery_delay: Duration::from_millis(config.recovery_delay_ms),
            max_attempts: config.max_recovery_attempts,
            on_event: Box::new(on_event),
            stats: Arc::clone(&stats),
        };
        let handle = thread::Builder::new()
            .name("audio-health-monitor".into())
            .spawn(move || watcher.run(stop_rx))
            .map_err(|e| TrainerError::DeviceInitFailed(format!("cannot spawn health monitor: {e}")))?;
        info!(
            "[HEALTH] monitoring started ({} ms interval, {} recovery attempts)",
            config.interval_ms, config.max_recovery_attempts
        );
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> MonitorStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it, including any recovery in flight.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread even mid-delay.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[HEALTH] monitor thread panicked");
            }
            info!("[HEALTH] monitoring stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Watcher {
    manager: AudioManager,
    interval: Duration,
    recovery_delay: Duration,
    max_attempts: u32,
    on_event: EventCallback,
    stats: Arc<Mutex<MonitorStats>>,
}

impl Watcher {
    fn emit(&mut self, event: HealthEvent) {
        if catch_unwind(AssertUnwindSafe(|| (self.on_event)(&event))).is_err() {
            error!("[HEALTH] event callback panicked on {:?}", event);
        }
    }

    fn record(&self, update: impl FnOnce(&mut MonitorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    fn run(mut self, stop_rx: Receiver<()>) {
        let ticker = tick(self.interval);
        let mut attempts = 0u32;
        let mut gave_up = false;
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {}
            }

            let health = self.manager.check_health();
            if health.ref_count == 0 {
                // Idle: nothing to watch, and the next session gets a fresh budget.
                attempts = 0;
                gave_up = false;
                continue;
            }
            self.record(|s| s.checks += 1);
            if health.healthy {
                continue;
            }
            self.record(|s| s.unhealthy_checks += 1);
            if gave_up {
                continue;
            }

            warn!("[HEALTH] unhealthy capture: state {:?}, stream {:?}", health.state, health.stream);
            self.emit(HealthEvent::Unhealthy(health));
            if attempts >= self.max_attempts {
                error!("[HEALTH] {} recovery attempts failed, giving up", attempts);
                gave_up = true;
                self.emit(HealthEvent::GaveUp { attempts });
                continue;
            }

            attempts += 1;
            info!("[HEALTH] recovery attempt {}/{}", attempts, self.max_attempts);
            self.emit(HealthEvent::RecoveryStarted {
                attempt: attempts,
                max_attempts: self.max_attempts,
            });
            select! {
                recv(stop_rx) -> _ => break,
                recv(after(self.recovery_delay)) -> _ => {}
            }

            self.record(|s| s.recovery_attempts += 1);
            match self.manager.recover() {
                Ok(handle) => {
                    info!("[HEALTH] capture recovered ({} Hz)", handle.sample_rate);
                    self.record(|s| s.recoveries += 1);
                    self.emit(HealthEvent::Recovered { attempt: attempts });
                }
                Err(e) => {
                    warn!("[HEALTH] recovery attempt {} failed: {}", attempts, e);
                    self.record(|s| s.failed_recoveries += 1);
                    self.emit(HealthEvent::RecoveryFailed { attempt: attempts, error: e });
                }
            }
        }
        debug!("[HEALTH] monitor thread exiting");
    }
}
