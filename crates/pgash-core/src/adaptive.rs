//! Adaptive sampler: closed-loop control of the telemetry retention rate.
//!
//! The rate is re-evaluated every `evaluation_interval` from [`LoadMetrics`]:
//!
//! ```text
//!   high load  ──►  rate × decrease_factor        (floored at min_rate)
//!   low load   ──►  rate + increase_step          (capped at max_rate)
//!   steady     ──►  unchanged
//! ```
//!
//! No single step moves the rate by more than `max_step_fraction` of its
//! current value. Per-sample decisions hash the session id into `[0, 1)` and
//! compare against the rate, so a given session is consistently in or out at
//! a given rate. Blocked, long-running and maintenance sessions bypass the
//! rate when their `always_sample_*` policy is on.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::AdaptiveSamplerConfig;
use crate::model::{SampleReason, SamplingDecision, SessionSample};

/// Maps `key` uniformly into `[0, 1)`.
pub fn unit_hash(key: &str) -> f64 {
    // top 53 bits fit an f64 mantissa exactly
    (xxh3_64(key.as_bytes()) >> 11) as f64 / (1u64 << 53) as f64
}

/// Load signals for one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadMetrics {
    pub active_sessions: usize,
    /// Datapoints per second emitted since the previous evaluation.
    pub throughput: f64,
    /// Zero means no throughput target.
    pub target_throughput: f64,
    /// Batches dropped upstream since the previous evaluation.
    pub drops: u64,
    pub queue_length: usize,
    /// Fraction of the memory budget in use, `0.0..=1.0`.
    pub memory_pressure: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadLevel {
    Low,
    #[default]
    Steady,
    High,
}

impl LoadLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadLevel::Low => "low",
            LoadLevel::Steady => "steady",
            LoadLevel::High => "high",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdaptiveStats {
    pub evaluations: u64,
    pub current_rate: f64,
    pub last_load: LoadLevel,
    pub admitted_by_rate: u64,
    pub admitted_blocked: u64,
    pub admitted_long_running: u64,
    pub admitted_maintenance: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct State {
    rate: f64,
    last_evaluation: Option<Instant>,
    stats: AdaptiveStats,
}

pub struct AdaptiveSampler {
    config: AdaptiveSamplerConfig,
    state: Mutex<State>,
}

impl AdaptiveSampler {
    /// Creates a sampler seeded at `base_rate` (clamped into bounds).
    pub fn new(config: AdaptiveSamplerConfig) -> Self {
        let rate = config.base_rate.clamp(config.min_rate, config.max_rate);
        Self {
            state: Mutex::new(State {
                rate,
                last_evaluation: None,
                stats: AdaptiveStats {
                    current_rate: rate,
                    ..Default::default()
                },
            }),
            config,
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn stats(&self) -> AdaptiveStats {
        self.state.lock().stats.clone()
    }

    /// Classifies load from the pressure signals and session thresholds.
    pub fn classify(&self, m: &LoadMetrics) -> LoadLevel {
        let c = &self.config;
        let pressure = m.drops > 0
            || m.queue_length > c.max_queue_length
            || m.memory_pressure >= c.memory_pressure_threshold
            || (m.target_throughput > 0.0 && m.throughput > m.target_throughput);

        if pressure || m.active_sessions > c.high_session_threshold {
            LoadLevel::High
        } else if m.active_sessions < c.low_session_threshold {
            LoadLevel::Low
        } else {
            LoadLevel::Steady
        }
    }

    fn next_rate(&self, rate: f64, load: LoadLevel) -> f64 {
        let c = &self.config;
        let proposed = match load {
            LoadLevel::High => rate * c.decrease_factor,
            LoadLevel::Low => rate + c.increase_step,
            LoadLevel::Steady => rate,
        };
        let max_step = rate * c.max_step_fraction;
        let delta = (proposed - rate).clamp(-max_step, max_step);
        (rate + delta).clamp(c.min_rate, c.max_rate)
    }

    /// Runs one evaluation and returns the new rate.
    pub fn evaluate(&self, metrics: &LoadMetrics) -> f64 {
        self.evaluate_at(Instant::now(), metrics)
    }

    fn evaluate_at(&self, now: Instant, metrics: &LoadMetrics) -> f64 {
        let load = self.classify(metrics);
        let mut state = self.state.lock();
        let old = state.rate;
        let new = self.next_rate(old, load);

        state.rate = new;
        state.last_evaluation = Some(now);
        state.stats.evaluations += 1;
        state.stats.current_rate = new;
        state.stats.last_load = load;

        if (new - old).abs() > f64::EPSILON {
            info!(
                load = load.as_str(),
                old_rate = old,
                new_rate = new,
                active_sessions = metrics.active_sessions,
                drops = metrics.drops,
                queue_length = metrics.queue_length,
                "sampling rate adjusted"
            );
        } else {
            debug!(load = load.as_str(), rate = new, "sampling rate unchanged");
        }
        new
    }

    /// Returns true when the next evaluation is due.
    pub fn evaluation_due(&self, now: Instant) -> bool {
        evaluation_due(
            self.state.lock().last_evaluation,
            now,
            self.config.evaluation_interval,
        )
    }

    /// Evaluates only when due. Returns the new rate if an evaluation ran.
    pub fn evaluate_if_due(&self, now: Instant, metrics: &LoadMetrics) -> Option<f64> {
        self.evaluation_due(now)
            .then(|| self.evaluate_at(now, metrics))
    }

    fn policy(&self, sample: &SessionSample) -> Option<SampleReason> {
        let c = &self.config;
        if c.always_sample_blocked && sample.is_blocked() {
            Some(SampleReason::Blocked)
        } else if c.always_sample_long_running
            && sample.query_duration_ms() > c.slow_query_threshold_ms
        {
            Some(SampleReason::LongRunning)
        } else if c.always_sample_maintenance && sample.is_maintenance() {
            Some(SampleReason::Maintenance)
        } else {
            None
        }
    }

    /// Admission rule for one sample at `rate`.
    pub fn should_sample(&self, sample: &SessionSample, rate: f64) -> bool {
        self.policy(sample).is_some() || unit_hash(&sample.session_id) < rate
    }

    /// Decides one sample at the current rate and records the outcome.
    pub fn decide(&self, sample: &SessionSample) -> SamplingDecision {
        let mut state = self.state.lock();
        let rate = state.rate;
        let decision = match self.policy(sample) {
            Some(reason) => SamplingDecision::always(rate, reason),
            None => SamplingDecision::by_rate(unit_hash(&sample.session_id) < rate, rate),
        };

        let stats = &mut state.stats;
        match decision.reason {
            SampleReason::Rate => stats.admitted_by_rate += 1,
            SampleReason::Blocked => stats.admitted_blocked += 1,
            SampleReason::LongRunning => stats.admitted_long_running += 1,
            SampleReason::Maintenance => stats.admitted_maintenance += 1,
            SampleReason::Rejected => stats.rejected += 1,
        }
        decision
    }
}

/// Returns true if an evaluation should run now.
fn evaluation_due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last {
        None => true,
        Some(t) => now.saturating_duration_since(t) >= interval,
    }
}
