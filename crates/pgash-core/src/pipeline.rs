//! Per-batch processing.
//!
//! ```text
//! SampleBatch
//!   │  AdaptiveSampler (evaluate when due, decide per sample)
//!   ▼
//! admitted samples ── QueryCorrelator ── PlanExtractor (slow only)
//!   │
//!   ▼
//! DataPoint[] ── CostControlGate ──► sink
//! ```
//!
//! Every stage runs synchronously in this order for each batch. Enrichment
//! failures degrade the datapoint, they never drop it.

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

use crate::adaptive::{AdaptiveSampler, AdaptiveStats, LoadMetrics};
use crate::config::PipelineConfig;
use crate::correlator::{Correlation, CorrelatorStats, QueryCorrelator};
use crate::cost::{CostControlGate, CostReport};
use crate::model::{
    DataPoint, METRIC_ACTIVE_SESSIONS, METRIC_BLOCKED_SESSIONS, METRIC_LONG_RUNNING_QUERIES,
    METRIC_WAIT_EVENTS, SampleBatch, SamplingDecision, SessionSample,
};
use crate::plan::{PlanError, PlanExtractor, PlanOutcome, PlanStats};
use crate::sampler::SamplerView;
use crate::source::QueryExecutor;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub batches: u64,
    pub samples_seen: u64,
    pub samples_admitted: u64,
    pub datapoints_emitted: u64,
    pub datapoints_dropped: u64,
    pub plans_attached: u64,
    pub plan_failures: u64,
    pub rate_evaluations: u64,
}

pub struct Pipeline<E: QueryExecutor> {
    config: PipelineConfig,
    adaptive: AdaptiveSampler,
    correlator: QueryCorrelator,
    plans: Option<PlanExtractor<E>>,
    cost: CostControlGate,
    upstream: Option<SamplerView>,
    /// Upstream drop counter at the previous evaluation.
    drops_seen: u64,
    emitted_since_eval: u64,
    last_eval: Option<Instant>,
    stats: PipelineStats,
}

impl<E: QueryExecutor> Pipeline<E> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            adaptive: AdaptiveSampler::new(config.adaptive_sampler.clone()),
            correlator: QueryCorrelator::new(config.query_correlator.clone()),
            cost: CostControlGate::new(config.cost_control.clone()),
            plans: None,
            upstream: None,
            drops_seen: 0,
            emitted_since_eval: 0,
            last_eval: None,
            stats: PipelineStats::default(),
            config,
        }
    }

    /// Attaches plan extraction for slow queries. Ignored when disabled in config.
    pub fn with_plan_extractor(mut self, plans: PlanExtractor<E>) -> Self {
        if self.config.plan_extractor.enabled && plans.is_enabled() {
            self.plans = Some(plans);
        }
        self
    }

    /// Reads drop counts and buffer fill from the sampler feeding this pipeline.
    pub fn with_sampler_view(mut self, view: SamplerView) -> Self {
        self.upstream = Some(view);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.clone()
    }

    pub fn adaptive_stats(&self) -> AdaptiveStats {
        self.adaptive.stats()
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.correlator.stats()
    }

    pub fn cost_report(&self) -> CostReport {
        self.cost.report()
    }

    pub fn plan_stats(&self) -> Option<PlanStats> {
        self.plans.as_ref().map(|p| p.stats())
    }

    pub fn current_rate(&self) -> f64 {
        self.adaptive.current_rate()
    }

    /// Processes one batch and returns the datapoints admitted by cost control.
    ///
    /// `queue_len` is the number of batches waiting behind this one.
    pub fn process_batch(&mut self, batch: SampleBatch, queue_len: usize) -> Vec<DataPoint> {
        self.process_batch_at(batch, queue_len, Instant::now())
    }

    /// Same as [`Pipeline::process_batch`] with an explicit monotonic clock.
    pub fn process_batch_at(
        &mut self,
        batch: SampleBatch,
        queue_len: usize,
        now: Instant,
    ) -> Vec<DataPoint> {
        self.stats.batches += 1;
        self.stats.samples_seen += batch.len() as u64;
        self.maybe_evaluate(&batch, queue_len, now);

        let mut out = Vec::new();
        let mut admitted = 0usize;
        for sample in &batch.samples {
            let decision = self.adaptive.decide(sample);
            if !decision.sampled {
                continue;
            }
            admitted += 1;

            let correlation = self.correlator.correlate(sample);
            let plan = if correlation.is_slow {
                self.plan_for(sample)
            } else {
                None
            };

            for mut point in build_datapoints(sample, &decision, &correlation, plan.as_ref()) {
                if self.cost.admit(&mut point) {
                    out.push(point);
                } else {
                    self.stats.datapoints_dropped += 1;
                }
            }
        }

        self.stats.samples_admitted += admitted as u64;
        self.stats.datapoints_emitted += out.len() as u64;
        self.emitted_since_eval += out.len() as u64;
        debug!(
            tick = batch.tick,
            samples = batch.len(),
            admitted,
            datapoints = out.len(),
            rate = self.adaptive.current_rate(),
            "batch processed"
        );
        out
    }

    fn maybe_evaluate(&mut self, batch: &SampleBatch, queue_len: usize, now: Instant) {
        if !self.adaptive.evaluation_due(now) {
            return;
        }
        let (drops_total, memory_pressure) = match &self.upstream {
            Some(view) => {
                let s = view.stats();
                let capacity = self.config.session_sampler.buffer_size.max(1);
                (s.dropped_batches, s.buffered as f64 / capacity as f64)
            }
            None => (0, 0.0),
        };
        let throughput = match self.last_eval {
            Some(last) => {
                let secs = now.saturating_duration_since(last).as_secs_f64();
                if secs > 0.0 {
                    self.emitted_since_eval as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let metrics = LoadMetrics {
            active_sessions: batch.active_sessions(),
            throughput,
            target_throughput: self.config.adaptive_sampler.target_throughput,
            drops: drops_total.saturating_sub(self.drops_seen),
            queue_length: queue_len,
            memory_pressure,
        };
        if self.adaptive.evaluate_if_due(now, &metrics).is_some() {
            self.stats.rate_evaluations += 1;
            self.drops_seen = drops_total;
            self.emitted_since_eval = 0;
            self.last_eval = Some(now);
        }
    }

    fn plan_for(&mut self, sample: &SessionSample) -> Option<PlanOutcome> {
        let plans = self.plans.as_ref()?;
        let text = sample.query_text.as_deref()?;
        match plans.explain_in(&sample.database_name, text) {
            Ok(outcome) => {
                self.stats.plans_attached += 1;
                Some(outcome)
            }
            Err(PlanError::Unsafe(_)) => None,
            Err(e) => {
                self.stats.plan_failures += 1;
                debug!(session_id = %sample.session_id, error = %e, "datapoint emitted without plan");
                None
            }
        }
    }

    /// Logs a one-line summary of every stage.
    pub fn log_summary(&self) {
        let adaptive = self.adaptive.stats();
        let correlator = self.correlator.stats();
        let cost = self.cost.report();
        info!(
            batches = self.stats.batches,
            samples = self.stats.samples_seen,
            admitted = self.stats.samples_admitted,
            emitted = self.stats.datapoints_emitted,
            budget_dropped = self.stats.datapoints_dropped,
            rate = adaptive.current_rate,
            load = adaptive.last_load.as_str(),
            groups = correlator.active_groups,
            window_admitted = cost.admitted,
            plans = self.stats.plans_attached,
            plan_failures = self.stats.plan_failures,
            "pipeline summary"
        );
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Attributes shared by every datapoint derived from one sample.
fn base_point(
    name: &str,
    value: f64,
    sample: &SessionSample,
    decision: &SamplingDecision,
    correlation: &Correlation,
    plan: Option<&PlanOutcome>,
) -> DataPoint {
    let mut p = DataPoint::new(name, sample.timestamp, value)
        .with("session.id", sample.session_id.as_str())
        .with("session.pid", sample.pid as i64)
        .with("session.state", sample.state.as_str())
        .with_opt("db.name", non_empty(&sample.database_name))
        .with_opt("db.user", non_empty(&sample.username))
        .with_opt("application.name", non_empty(&sample.application_name))
        .with_opt("client.address", non_empty(&sample.client_address))
        .with_opt("backend.type", non_empty(&sample.backend_type))
        .with("backend.start", rfc3339(sample.backend_start))
        .with("state.change", rfc3339(sample.state_change))
        .with_opt("transaction.start", sample.transaction_start.map(rfc3339))
        .with_opt("query.start", sample.query_start.map(rfc3339))
        .with_opt("wait_event.type", sample.wait_event_type.clone())
        .with_opt("wait_event.name", sample.wait_event.clone())
        .with_opt("query.text", sample.query_text.clone())
        .with_opt("query.id", sample.query_id)
        .with_opt("blocking.session_id", sample.blocking_session_id.clone())
        .with_opt("blocking.query", sample.blocking_query_text.clone())
        .with("sampling.rate", decision.rate)
        .with("sampling.reason", decision.reason.as_str())
        .with("query.is_slow", correlation.is_slow)
        .with("query.is_frequent", correlation.is_frequent)
        .with_opt("correlation.key", correlation.key.clone())
        .with_opt("query.category", correlation.category.map(|c| c.as_str()))
        .with_opt(
            "query.performance_category",
            correlation.performance_category.map(|c| c.as_str()),
        );

    if sample.query_duration().is_some() {
        p.set("query.duration_ms", sample.query_duration_ms() as i64);
    }
    if !correlation.correlated_queries.is_empty() {
        p.set("correlation.queries", correlation.correlated_queries.join(","));
    }
    if let Some(plan) = plan {
        p.set("plan.fingerprint", plan.plan_fingerprint.as_str());
        p.set("plan.total_cost", plan.plan.total_cost());
        if let Some(r) = &plan.regression {
            p.set("plan.regression", r.severity.as_str());
        }
    }
    p
}

/// Datapoints for one admitted sample.
fn build_datapoints(
    sample: &SessionSample,
    decision: &SamplingDecision,
    correlation: &Correlation,
    plan: Option<&PlanOutcome>,
) -> Vec<DataPoint> {
    let point = |name: &str, value: f64| base_point(name, value, sample, decision, correlation, plan);

    let mut points = vec![point(METRIC_ACTIVE_SESSIONS, 1.0)];
    if sample.is_waiting() {
        points.push(point(METRIC_WAIT_EVENTS, 1.0));
    }
    if sample.is_blocked() {
        points.push(point(METRIC_BLOCKED_SESSIONS, 1.0));
    }
    if correlation.is_slow {
        points.push(point(
            METRIC_LONG_RUNNING_QUERIES,
            sample.query_duration_ms() as f64,
        ));
    }
    points
}
