//! # Health Supervisor
//!
//! Periodic resource checks and the transport watchdog.
//!
//! ## Throttling
//!
//! Above `temperature_threshold` the supervisor sets `throttled`, and the transport
//! loop adds `throttle_delay_ms` between polls. The flag clears once the temperature
//! drops below `temperature_threshold - temperature_hysteresis`. CPU, memory and
//! swap thresholds are only reported.
//!
//! ## Watchdog
//!
//! The transport loop calls [`HealthSupervisor::heartbeat`] on every iteration. The
//! supervisor's own timer compares the last heartbeat with `watchdog_timeout`; a miss
//! marks the process unhealthy and signals the loop to rebind, once per episode.
//! Each trip bumps [`HealthSupervisor::watchdog_trips`]; a signal raised before the
//! loop's current bind is stale and ignored by the loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Components, System};
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// One resource measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub swap_percent: f64,
    /// Hottest sensor, if the host exposes any
    pub temperature_c: Option<f64>,
}

/// Source of resource measurements
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Host probe backed by `sysinfo`
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_swap = self.system.total_swap();
        let swap_percent = if total_swap == 0 {
            0.0
        } else {
            self.system.used_swap() as f64 / total_swap as f64 * 100.0
        };

        let components = Components::new_with_refreshed_list();
        let temperature_c = components
            .iter()
            .map(|component| component.temperature() as f64)
            .filter(|t| t.is_finite())
            .reduce(f64::max);

        ResourceSample {
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_used_mb: self.system.used_memory() / 1024 / 1024,
            swap_percent,
            temperature_c,
        }
    }
}

/// Health view shared with collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthState {
    pub last_watchdog_heartbeat: Option<DateTime<Utc>>,
    pub last_measured_temperature: Option<f64>,
    pub last_measured_memory_mb: Option<u64>,
    pub last_measured_cpu_percent: Option<f64>,
    pub throttled: bool,
    pub healthy: bool,
}

#[derive(Debug)]
struct Inner {
    state: HealthState,
    last_heartbeat_at: Instant,
    watchdog_tripped: bool,
    watchdog_trips: u64,
}

/// Resource monitor and transport watchdog
#[derive(Debug)]
pub struct HealthSupervisor {
    config: Arc<ServerConfig>,
    inner: Mutex<Inner>,
    rebind: Arc<Notify>,
}

impl HealthSupervisor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: HealthState {
                    healthy: true,
                    ..Default::default()
                },
                last_heartbeat_at: Instant::now(),
                watchdog_tripped: false,
                watchdog_trips: 0,
            }),
            rebind: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Liveness signal from the transport loop
    pub fn heartbeat(&self) {
        let mut inner = self.lock();
        inner.last_heartbeat_at = Instant::now();
        inner.state.last_watchdog_heartbeat = Some(Utc::now());
    }

    pub fn state(&self) -> HealthState {
        self.lock().state.clone()
    }

    pub fn is_throttled(&self) -> bool {
        self.lock().state.throttled
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().state.healthy
    }

    /// Number of watchdog episodes so far
    pub fn watchdog_trips(&self) -> u64 {
        self.lock().watchdog_trips
    }

    /// Notified when the watchdog demands a transport rebind
    pub fn rebind_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.rebind)
    }

    /// Apply a resource measurement
    pub fn apply_sample(&self, sample: ResourceSample) {
        let limits = &self.config.pi_zero_optimization;
        let mut inner = self.lock();
        let state = &mut inner.state;
        state.last_measured_memory_mb = Some(sample.memory_used_mb);
        state.last_measured_cpu_percent = Some(sample.cpu_percent);
        state.last_measured_temperature = sample.temperature_c;

        if let Some(temperature) = sample.temperature_c {
            if !state.throttled && temperature > limits.temperature_threshold {
                state.throttled = true;
                warn!(
                    "Temperature {:.1}°C above {:.1}°C, throttling polls",
                    temperature, limits.temperature_threshold
                );
            } else if state.throttled
                && temperature < limits.temperature_threshold - limits.temperature_hysteresis
            {
                state.throttled = false;
                info!("Temperature back to {:.1}°C, throttling cleared", temperature);
            }
        }

        if sample.cpu_percent > limits.cpu_threshold {
            warn!("High CPU usage: {:.1}%", sample.cpu_percent);
        }
        if sample.memory_used_mb > limits.memory_limit_mb {
            warn!(
                "Memory usage {} MB above limit {} MB",
                sample.memory_used_mb, limits.memory_limit_mb
            );
        }
        if sample.swap_percent > limits.swap_usage_threshold {
            warn!("High swap usage: {:.1}%", sample.swap_percent);
        }
        debug!(
            "Resources: cpu={:.1}% mem={}MB swap={:.1}% temp={:?}",
            sample.cpu_percent, sample.memory_used_mb, sample.swap_percent, sample.temperature_c
        );
    }

    /// Check the watchdog at `now`. Returns `true` if this check tripped it.
    pub fn check_watchdog(&self, now: Instant) -> bool {
        let features = &self.config.industrial_features;
        if !features.enable_watchdog {
            return false;
        }

        let mut inner = self.lock();
        let silent_for = now.saturating_duration_since(inner.last_heartbeat_at);
        if silent_for > features.watchdog_timeout() {
            inner.state.healthy = false;
            if inner.watchdog_tripped {
                return false;
            }
            inner.watchdog_tripped = true;
            inner.watchdog_trips += 1;
            drop(inner);
            warn!(
                "Watchdog: no transport heartbeat for {:?}, forcing rebind",
                silent_for
            );
            self.rebind.notify_one();
            true
        } else {
            if inner.watchdog_tripped {
                info!("Watchdog: transport heartbeat recovered");
            }
            inner.watchdog_tripped = false;
            inner.state.healthy = true;
            false
        }
    }

    /// Run the periodic checks until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut probe: Box<dyn ResourceProbe>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let check_period = self.config.pi_zero_optimization.check_interval();
        let watchdog_period =
            (self.config.industrial_features.watchdog_timeout() / 2).max(Duration::from_secs(1));

        let mut resources = interval(check_period);
        let mut watchdog = interval(watchdog_period);
        resources.set_missed_tick_behavior(MissedTickBehavior::Delay);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Health supervisor started: resources every {:?}, watchdog every {:?}",
            check_period, watchdog_period
        );
        loop {
            tokio::select! {
                _ = resources.tick() => {
                    let sample = probe.sample();
                    self.apply_sample(sample);
                }
                _ = watchdog.tick() => {
                    self.check_watchdog(Instant::now());
                }
                _ = shutdown.recv() => {
                    info!("Health supervisor stopped");
                    break;
                }
            }
        }
    }
}
