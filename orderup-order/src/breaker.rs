use orderup_core::GatewayError;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// When to stop calling a gateway and for how long.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive health failures that open the circuit
    pub failure_threshold: usize,
    /// How long an open circuit refuses calls before letting one trial call through
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing fast
    HalfOpen, // One trial call decides
}

#[derive(Debug)]
enum Slot {
    Closed { failures: usize },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Circuit breaker in front of one gateway.
///
/// Only calls the engine actually makes pass through it, so operations that
/// never reach the gateway (zero-total charges, repeated fulfillment of a
/// fulfilled order) are unaffected by an open circuit. A declined card or any
/// other 4xx answer proves the gateway is up and counts as healthy.
pub struct CircuitBreaker {
    name: &'static str,
    settings: BreakerSettings,
    slot: Mutex<Slot>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, settings: BreakerSettings) -> Self {
        Self {
            name,
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                ..settings
            },
            slot: Mutex::new(Slot::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Slot::Closed { .. } => CircuitState::Closed,
            Slot::Open { until } if Instant::now() < until => CircuitState::Open,
            Slot::Open { .. } | Slot::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Admit one call, or refuse it with [`GatewayError::Unavailable`].
    ///
    /// The returned permit must be settled with [`Permit::record`]; a permit
    /// dropped unsettled (the call was cancelled) frees the half-open trial
    /// slot without judging the gateway.
    pub fn admit(&self) -> Result<Permit<'_>, GatewayError> {
        let mut slot = self.lock();
        match *slot {
            Slot::Closed { .. } => {}
            Slot::Open { until } if Instant::now() >= until => {
                info!(circuit = self.name, "Circuit half-open, trying gateway");
                *slot = Slot::HalfOpen { trial_in_flight: true };
            }
            Slot::HalfOpen { trial_in_flight: false } => *slot = Slot::HalfOpen { trial_in_flight: true },
            Slot::Open { .. } | Slot::HalfOpen { trial_in_flight: true } => {
                return Err(GatewayError::Unavailable(format!("{} circuit is open", self.name)));
            }
        }
        Ok(Permit {
            breaker: self,
            settled: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The slot is always left consistent, so a poisoned lock is still usable
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_healthy(&self) {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Closed { .. }) {
            info!(circuit = self.name, "Circuit closed, gateway recovered");
        }
        *slot = Slot::Closed { failures: 0 };
    }

    fn on_failure(&self) {
        let mut slot = self.lock();
        let tripped = match *slot {
            Slot::Closed { failures } if failures + 1 < self.settings.failure_threshold => {
                *slot = Slot::Closed { failures: failures + 1 };
                false
            }
            Slot::Closed { .. } | Slot::HalfOpen { .. } => true,
            Slot::Open { .. } => false,
        };
        if tripped {
            *slot = Slot::Open {
                until: Instant::now() + self.settings.reset_timeout,
            };
            error!(
                circuit = self.name,
                reset_after = ?self.settings.reset_timeout,
                "Circuit opened, failing fast"
            );
        }
    }

    fn on_cancelled(&self) {
        let mut slot = self.lock();
        if let Slot::HalfOpen { trial_in_flight: true } = *slot {
            *slot = Slot::HalfOpen { trial_in_flight: false };
        }
    }
}

/// A failure that says something about the gateway's health
fn is_health_failure(err: &GatewayError) -> bool {
    match err {
        GatewayError::Transport(_) | GatewayError::Timeout(_) | GatewayError::Unavailable(_) => true,
        GatewayError::Rejected { status, .. } => *status >= 500,
    }
}

/// Admission to call the gateway once
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Permit<'_> {
    pub fn record<T>(mut self, outcome: &Result<T, GatewayError>) {
        self.settled = true;
        match outcome {
            Err(e) if is_health_failure(e) => self.breaker.on_failure(),
            _ => self.breaker.on_healthy(),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_cancelled();
        }
    }
}
