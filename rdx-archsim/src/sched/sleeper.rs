//! Watchdog that bounds how long a run may take.
//!
//! While a run is in progress a monitor thread drives a small tokio runtime
//! that polls on an interval and raises a flag once the budget is spent. The
//! scheduler only looks at the flag between ticks, so a handler is never
//! interrupted.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timeout settings, also accepted from configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub seconds: f64,
    /// Stop the run cleanly instead of failing with a timeout error.
    pub clean_exit: bool,
    /// Measure wall time instead of time spent in handlers.
    pub wall_clock: bool,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            seconds: 0.0,
            clean_exit: true,
            wall_clock: true,
        }
    }
}

/// What the scheduler learns when the budget ran out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expired {
    pub seconds: f64,
    pub clock: &'static str,
    pub clean_exit: bool,
}

struct Monitor {
    shutdown_tx: broadcast::Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
pub struct Sleeper {
    settings: Option<TimeoutSettings>,
    disabled: bool,
    fired: Arc<AtomicBool>,
    monitor: Option<Monitor>,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the budget for subsequent runs.
    pub fn set_timeout(&mut self, duration: Duration, clean_exit: bool, use_wall_clock: bool) {
        self.settings = Some(TimeoutSettings {
            seconds: duration.as_secs_f64(),
            clean_exit,
            wall_clock: use_wall_clock,
        });
    }

    pub fn apply(&mut self, settings: TimeoutSettings) {
        self.set_timeout(
            Duration::from_secs_f64(settings.seconds.max(0.0)),
            settings.clean_exit,
            settings.wall_clock,
        );
    }

    /// Turns the watchdog off entirely.
    pub fn disable(&mut self) {
        self.disabled = true;
        self.disarm();
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled && self.settings.is_some()
    }

    pub fn settings(&self) -> Option<TimeoutSettings> {
        self.settings
    }

    /// Starts the monitor for one run. `busy_nanos` is the scheduler's
    /// handler-time counter used when measuring CPU time.
    pub(crate) fn arm(&mut self, busy_nanos: Arc<AtomicU64>) {
        self.disarm();
        self.fired.store(false, Ordering::SeqCst);
        let Some(settings) = self.settings.filter(|_| !self.disabled) else {
            return;
        };
        let limit = Duration::from_secs_f64(settings.seconds.max(0.0));
        let fired = self.fired.clone();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let baseline = busy_nanos.load(Ordering::Relaxed);
        let spawned = std::thread::Builder::new()
            .name("archsim-sleeper".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("sleeper runtime unavailable: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let started = Instant::now();
                    let mut ticker = interval(POLL_INTERVAL);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            _ = ticker.tick() => {
                                let spent = if settings.wall_clock {
                                    started.elapsed()
                                } else {
                                    Duration::from_nanos(
                                        busy_nanos.load(Ordering::Relaxed).saturating_sub(baseline),
                                    )
                                };
                                if spent >= limit {
                                    fired.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                    }
                });
            });
        match spawned {
            Ok(thread) => {
                debug!(seconds = settings.seconds, wall = settings.wall_clock, "sleeper armed");
                self.monitor = Some(Monitor { shutdown_tx, thread });
            }
            Err(e) => warn!("could not start sleeper thread: {e}"),
        }
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.shutdown_tx.send(());
            if monitor.thread.join().is_err() {
                warn!("sleeper thread panicked");
            }
        }
    }

    /// Reports an expired budget, if the monitor raised its flag.
    pub fn expired(&self) -> Option<Expired> {
        if self.disabled || !self.fired.load(Ordering::SeqCst) {
            return None;
        }
        self.settings.map(|s| Expired {
            seconds: s.seconds,
            clock: if s.wall_clock { "wall" } else { "cpu" },
            clean_exit: s.clean_exit,
        })
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        self.disarm();
    }
}
