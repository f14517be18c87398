//! Datapoint budget enforcement.
//!
//! Admissions are tracked in a sliding log of timestamps covering the last
//! minute, so in `drop` mode no 60s window ever holds more than
//! `max_datapoints_per_minute` admitted points. In `sample` mode overflow is
//! thinned deterministically instead of discarded.
//!
//! High-cardinality attributes are stripped from every point before it is
//! counted.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::adaptive::unit_hash;
use crate::config::{CostControlConfig, EnforcementMode};
use crate::model::DataPoint;

const WINDOW: Duration = Duration::from_secs(60);

/// Tallies for one reporting window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CostReport {
    pub budget: u64,
    pub admitted: u64,
    pub dropped: u64,
    /// Over-budget points kept by `sample` mode (included in `admitted`).
    pub overflow_sampled: u64,
    pub per_metric: BTreeMap<String, u64>,
    /// How often each high-cardinality attribute was removed.
    pub stripped: BTreeMap<String, u64>,
}

impl CostReport {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            ..Default::default()
        }
    }
}

/// Returns true when a reporting window opened at `started` is over.
pub fn window_rolled_over(started: Instant, now: Instant) -> bool {
    now.saturating_duration_since(started) >= WINDOW
}

pub struct CostControlGate {
    config: CostControlConfig,
    /// Admission times of in-budget points, oldest first.
    admissions: VecDeque<Instant>,
    window_started: Option<Instant>,
    current: CostReport,
    last: Option<CostReport>,
}

impl CostControlGate {
    pub fn new(config: CostControlConfig) -> Self {
        let budget = config.max_datapoints_per_minute;
        Self {
            admissions: VecDeque::with_capacity(budget.min(100_000) as usize),
            window_started: None,
            current: CostReport::new(budget),
            last: None,
            config,
        }
    }

    /// Tallies of the window in progress.
    pub fn report(&self) -> CostReport {
        self.current.clone()
    }

    /// Tallies of the last completed window.
    pub fn last_report(&self) -> Option<&CostReport> {
        self.last.as_ref()
    }

    /// Points admitted within the trailing minute.
    pub fn in_window(&self) -> usize {
        self.admissions.len()
    }

    /// Strips high-cardinality attributes and decides whether `point` is emitted.
    pub fn admit(&mut self, point: &mut DataPoint) -> bool {
        self.admit_at(point, Instant::now())
    }

    pub(crate) fn admit_at(&mut self, point: &mut DataPoint, now: Instant) -> bool {
        self.roll_window(now);
        self.strip(point);

        while let Some(&oldest) = self.admissions.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.admissions.pop_front();
            } else {
                break;
            }
        }

        let admitted = if (self.admissions.len() as u64) < self.config.max_datapoints_per_minute {
            self.admissions.push_back(now);
            true
        } else {
            match self.config.enforcement_mode {
                EnforcementMode::Drop => false,
                EnforcementMode::Sample => {
                    let keep = unit_hash(&point_identity(point)) < self.config.overflow_sample_rate;
                    if keep {
                        self.current.overflow_sampled += 1;
                    }
                    keep
                }
            }
        };

        if admitted {
            self.current.admitted += 1;
            *self.current.per_metric.entry(point.name.clone()).or_default() += 1;
        } else {
            if self.current.dropped == 0 {
                debug!(budget = self.config.max_datapoints_per_minute,
                    mode = ?self.config.enforcement_mode, "datapoint budget exhausted");
            }
            self.current.dropped += 1;
        }
        admitted
    }

    fn strip(&mut self, point: &mut DataPoint) {
        for dim in &self.config.high_cardinality_dimensions {
            if point.attributes.remove(dim).is_some() {
                *self.current.stripped.entry(dim.clone()).or_default() += 1;
            }
        }
    }

    fn roll_window(&mut self, now: Instant) {
        match self.window_started {
            None => self.window_started = Some(now),
            Some(started) if window_rolled_over(started, now) => {
                let done = std::mem::replace(
                    &mut self.current,
                    CostReport::new(self.config.max_datapoints_per_minute),
                );
                info!(
                    budget = done.budget,
                    admitted = done.admitted,
                    dropped = done.dropped,
                    overflow_sampled = done.overflow_sampled,
                    metrics = done.per_metric.len(),
                    "cost control window closed"
                );
                self.last = Some(done);
                self.window_started = Some(now);
            }
            Some(_) => {}
        }
    }
}

/// Stable identity used for overflow thinning.
fn point_identity(point: &DataPoint) -> String {
    let mut id = format!(
        "{}|{}",
        point.name,
        point.timestamp.timestamp_nanos_opt().unwrap_or_default()
    );
    for (k, v) in &point.attributes {
        id.push('|');
        id.push_str(k);
        id.push('=');
        id.push_str(&v.to_string());
    }
    id
}
