//! Circuit breaker guarding calls into the monitored database.
//!
//! ```text
//!            failure_threshold failures
//!            within evaluation_window
//!   Closed ─────────────────────────────► Open
//!     ▲                                    │ recovery_timeout
//!     │ half_open_max_requests successes   ▼
//!     └─────────────────────────────── HalfOpen ──► Open (any failure)
//! ```
//!
//! A success while closed resets the failure count. All state lives under one
//! mutex; transitions are the only way it changes.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, PartialEq)]
pub enum BreakerError<E> {
    /// Rejected without invoking the call.
    Open,
    /// The call ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit open"),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BreakerError<E> {}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    /// Successful calls slower than `slow_call_threshold` (also counted as failures).
    pub slow_calls: u64,
    pub rejected: u64,
    pub times_opened: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: CircuitState,
    /// Consecutive failures while closed.
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    trials_admitted: u32,
    trials_succeeded: u32,
    stats: BreakerStats,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker. `name` labels log lines.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            ..inner.stats.clone()
        }
    }

    /// Returns whether a call may proceed now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.stats.times_opened += 1;
                warn!(breaker = %self.name, from = from.as_str(),
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "circuit opened");
            }
            CircuitState::HalfOpen => {
                inner.trials_admitted = 0;
                inner.trials_succeeded = 0;
                info!(breaker = %self.name, "circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.failures = 0;
                inner.window_start = None;
                inner.opened_at = None;
                info!(breaker = %self.name, "circuit closed");
            }
        }
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.recovery_timeout {
                inner.stats.rejected += 1;
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_max_requests {
                    inner.trials_admitted += 1;
                    true
                } else {
                    inner.stats.rejected += 1;
                    false
                }
            }
            _ => true,
        }
    }

    pub(crate) fn record_success_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.stats.successes += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.window_start = None;
            }
            CircuitState::HalfOpen => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.half_open_max_requests {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            // late result of a call admitted before opening
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.stats.failures += 1;
        match inner.state {
            CircuitState::Closed => {
                let in_window = inner.window_start.is_some_and(|start| {
                    now.saturating_duration_since(start) <= self.config.evaluation_window
                });
                if in_window {
                    inner.failures += 1;
                } else {
                    inner.failures = 1;
                    inner.window_start = Some(now);
                }
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Runs `f` if the circuit allows it and records the outcome.
    ///
    /// A successful call slower than `slow_call_threshold` still returns its
    /// value but counts as a failure.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        if !self.allow() {
            return Err(BreakerError::Open);
        }
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        let now = Instant::now();

        match result {
            Ok(value) => {
                if elapsed > self.config.slow_call_threshold {
                    self.inner.lock().stats.slow_calls += 1;
                    warn!(breaker = %self.name, duration_ms = elapsed.as_millis() as u64,
                        "slow call recorded as failure");
                    self.record_failure_at(now);
                } else {
                    self.record_success_at(now);
                }
                Ok(value)
            }
            Err(e) => {
                self.record_failure_at(now);
                Err(BreakerError::Inner(e))
            }
        }
    }
}
