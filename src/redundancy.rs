//! # Redundancy Manager
//!
//! Tracks consecutive failures of the active serial endpoint and decides when the
//! transport loop must move to the redundant port.
//!
//! - Failures above `failover_threshold` on the primary switch to the secondary when
//!   redundancy is enabled, resetting the failure count.
//! - The same condition on the secondary, or on the primary without redundancy, is
//!   fatal: the loop stops and the host supervisor decides what happens next.
//! - There is no automatic failback on a failure count. Failback happens either on
//!   explicit request or, if `failback_cooldown` is configured, as a trial once that
//!   long has passed on the secondary.
//!
//! ## Failback trial
//!
//! A cooldown failback rebinds to the primary without committing to it. The first
//! successful exchange on the primary confirms the failback. The first bind or I/O
//! failure during the trial returns to the secondary at once, without counting
//! toward a fatal outcome, and the cooldown starts over.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

/// Serial endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Primary,
    Secondary,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Redundancy state shared with collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportState {
    pub active: Endpoint,
    pub consecutive_failure_count: u32,
    pub last_switch_timestamp: Option<DateTime<Utc>>,
}

/// Outcome of recording an endpoint failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Keep retrying the current endpoint
    Continue,
    /// The active endpoint changed; rebind to it
    SwitchedTo(Endpoint),
    /// No endpoint left to try
    Fatal,
}

#[derive(Debug)]
struct Inner {
    state: TransportState,
    /// Monotonic time of the last switch, for the failback cooldown
    switched_at: Option<Instant>,
    failback_requested: bool,
    /// On the primary after a cooldown, not yet confirmed by traffic
    trial: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: TransportState {
                active: Endpoint::Primary,
                consecutive_failure_count: 0,
                last_switch_timestamp: None,
            },
            switched_at: None,
            failback_requested: false,
            trial: false,
        }
    }
}

/// Failover policy between the primary and the redundant serial port
#[derive(Debug)]
pub struct RedundancyManager {
    primary_port: String,
    redundant_port: Option<String>,
    enabled: bool,
    threshold: u32,
    failback_cooldown: Option<Duration>,
    inner: Mutex<Inner>,
}

impl RedundancyManager {
    pub fn new(
        primary_port: impl Into<String>,
        redundant_port: Option<String>,
        threshold: u32,
        failback_cooldown: Option<Duration>,
    ) -> Self {
        let enabled = redundant_port.is_some();
        Self {
            primary_port: primary_port.into(),
            redundant_port,
            enabled,
            threshold,
            failback_cooldown,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Build from the server configuration; the redundant port is only used when
    /// `enable_redundancy` is set.
    pub fn from_config(config: &ServerConfig) -> Self {
        let features = &config.industrial_features;
        let redundant_port = if features.enable_redundancy {
            features.redundant_port.clone()
        } else {
            None
        };
        Self::new(
            config.serial.port.clone(),
            redundant_port,
            features.failover_threshold,
            features.failback_cooldown(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> TransportState {
        self.lock().state.clone()
    }

    pub fn active_endpoint(&self) -> Endpoint {
        self.lock().state.active
    }

    /// Back to the primary endpoint with no failure history
    pub fn reset(&self) {
        *self.lock() = Inner::new();
    }

    /// Whether the primary is being tried after a cooldown failback
    pub fn in_failback_trial(&self) -> bool {
        self.lock().trial
    }

    /// Device path of an endpoint
    pub fn port_for(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Primary => &self.primary_port,
            Endpoint::Secondary => self.redundant_port.as_deref().unwrap_or(&self.primary_port),
        }
    }

    /// Device path of the active endpoint
    pub fn active_port(&self) -> &str {
        self.port_for(self.active_endpoint())
    }

    /// Record a failure of the active endpoint
    pub fn record_failure(&self) -> FailoverDecision {
        let mut inner = self.lock();
        if inner.trial {
            self.switch(&mut inner, Endpoint::Secondary);
            warn!(
                "Primary port {} still failing, back to redundant port {}",
                self.primary_port,
                self.port_for(Endpoint::Secondary)
            );
            return FailoverDecision::SwitchedTo(Endpoint::Secondary);
        }

        inner.state.consecutive_failure_count = inner.state.consecutive_failure_count.saturating_add(1);
        let failures = inner.state.consecutive_failure_count;
        if failures <= self.threshold {
            warn!(
                "{} endpoint failure {}/{}",
                inner.state.active, failures, self.threshold
            );
            return FailoverDecision::Continue;
        }

        match inner.state.active {
            Endpoint::Primary if self.enabled => {
                self.switch(&mut inner, Endpoint::Secondary);
                warn!(
                    "Failing over to redundant port {} after {} failures",
                    self.port_for(Endpoint::Secondary),
                    failures
                );
                FailoverDecision::SwitchedTo(Endpoint::Secondary)
            }
            active => {
                error!(
                    "{} endpoint failed {} times with no endpoint left to try",
                    active, failures
                );
                FailoverDecision::Fatal
            }
        }
    }

    /// Record a successful exchange on the active endpoint
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state.consecutive_failure_count = 0;
        if inner.trial {
            inner.trial = false;
            info!("Failback to primary port {} confirmed", self.primary_port);
        }
    }

    /// Ask for a return to the primary endpoint at the next opportunity
    pub fn request_failback(&self) {
        let mut inner = self.lock();
        if inner.state.active == Endpoint::Secondary {
            info!("Failback to primary endpoint requested");
            inner.failback_requested = true;
        }
    }

    /// Apply a pending failback.
    ///
    /// Returns the new endpoint when the loop must rebind: after an explicit request
    /// (committed at once), or once the cooldown has elapsed on the secondary (as a trial).
    pub fn maybe_failback(&self, now: Instant) -> Option<Endpoint> {
        let mut inner = self.lock();
        if inner.state.active != Endpoint::Secondary {
            return None;
        }

        if inner.failback_requested {
            self.switch(&mut inner, Endpoint::Primary);
            info!("Failing back to primary port {}", self.primary_port);
            return Some(Endpoint::Primary);
        }

        let cooled_down = match (self.failback_cooldown, inner.switched_at) {
            (Some(cooldown), Some(at)) => now.saturating_duration_since(at) >= cooldown,
            _ => false,
        };
        if !cooled_down {
            return None;
        }

        self.switch(&mut inner, Endpoint::Primary);
        inner.trial = true;
        info!("Trying primary port {} after cooldown", self.primary_port);
        Some(Endpoint::Primary)
    }

    fn switch(&self, inner: &mut Inner, to: Endpoint) {
        inner.state.active = to;
        inner.state.consecutive_failure_count = 0;
        inner.state.last_switch_timestamp = Some(Utc::now());
        inner.switched_at = Some(Instant::now());
        inner.failback_requested = false;
        inner.trial = false;
    }
}
