//! Circuit breaker state machine.
//!
//! Transitions:
//! - Closed -> Open: `max_failures` consecutive failures/timeouts
//! - Open -> HalfOpen: first call after `reset_timeout` (that call is the trial)
//! - HalfOpen -> Closed: trial succeeded
//! - HalfOpen -> Open: trial failed
//!
//! The machine is synchronous and takes `now` explicitly; the owning `CallGate`
//! feeds it from its sequential loop, so no locking is needed here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::observability::BreakerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without reaching the worker.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

/// Transition hooks. Must not feed back into the breaker.
pub trait BreakerListener: Send + Sync {
    fn on_open(&self, _name: &str) {}
    fn on_half_open(&self, _name: &str) {}
    fn on_close(&self, _name: &str) {}
}

/// Default listener: logs each transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl BreakerListener for TracingListener {
    fn on_open(&self, name: &str) {
        warn!(component = %name, "circuit breaker is open");
    }

    fn on_half_open(&self, name: &str) {
        info!(component = %name, "circuit breaker is half open, next call will go through");
    }

    fn on_close(&self, name: &str) {
        info!(component = %name, "circuit breaker is closed");
    }
}

/// Ticket for an admitted call. Report the outcome with the same permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    trial: bool,
}

impl Permit {
    /// Is this the single HalfOpen trial call?
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Permit),
    Rejected,
}

#[derive(Debug, Clone, Default)]
struct BreakerStats {
    admitted: u64,
    succeeded: u64,
    failed: u64,
    rejected: u64,
    opened: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_transition: Instant,
    /// Bumped on every transition; outcomes of permits from older generations
    /// are counted but do not move the state.
    generation: u64,
    trial_outstanding: bool,
    listener: Arc<dyn BreakerListener>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, now: Instant) -> Self {
        let name = name.into();
        info!(
            component = %name,
            max_failures = config.max_failures,
            call_timeout_ms = config.call_timeout.as_millis() as u64,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "circuit breaker initialized"
        );

        Self {
            name,
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_transition: now,
            generation: 0,
            trial_outstanding: false,
            listener: Arc::new(TracingListener),
            stats: BreakerStats::default(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// Decide whether a call may go through right now.
    pub fn try_acquire(&mut self, now: Instant) -> Admission {
        let admission = match self.state {
            CircuitState::Closed => self.permit(false),
            CircuitState::Open => {
                let open_for = now.saturating_duration_since(self.last_transition);
                if open_for >= self.config.reset_timeout {
                    self.transition(CircuitState::HalfOpen, now);
                    self.trial_outstanding = true;
                    self.permit(true)
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_outstanding {
                    Admission::Rejected
                } else {
                    self.trial_outstanding = true;
                    self.permit(true)
                }
            }
        };

        match admission {
            Admission::Admitted(_) => self.stats.admitted += 1,
            Admission::Rejected => self.stats.rejected += 1,
        }
        admission
    }

    pub fn record_success(&mut self, permit: Permit, now: Instant) {
        self.stats.succeeded += 1;
        if self.is_stale(permit) {
            return;
        }

        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => self.transition(CircuitState::Closed, now),
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, permit: Permit, now: Instant) {
        self.stats.failed += 1;
        if self.is_stale(permit) {
            return;
        }

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                debug!(
                    component = %self.name,
                    failure_count = self.failure_count,
                    max_failures = self.config.max_failures,
                    "call failed while closed"
                );
                if self.failure_count >= self.config.max_failures {
                    self.transition(CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            admitted: self.stats.admitted,
            succeeded: self.stats.succeeded,
            failed: self.stats.failed,
            rejected: self.stats.rejected,
            opened: self.stats.opened,
        }
    }

    fn permit(&self, trial: bool) -> Admission {
        Admission::Admitted(Permit {
            generation: self.generation,
            trial,
        })
    }

    fn is_stale(&self, permit: Permit) -> bool {
        let stale = permit.generation != self.generation;
        if stale {
            debug!(
                component = %self.name,
                state = ?self.state,
                "ignoring outcome of a call admitted before the last transition"
            );
        }
        stale
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.last_transition = now;
        self.generation += 1;

        match to {
            CircuitState::Open => {
                self.failure_count = 0;
                self.trial_outstanding = false;
                self.stats.opened += 1;
                self.listener.on_open(&self.name);
            }
            CircuitState::HalfOpen => {
                self.listener.on_half_open(&self.name);
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.trial_outstanding = false;
                self.listener.on_close(&self.name);
            }
        }
    }
}
