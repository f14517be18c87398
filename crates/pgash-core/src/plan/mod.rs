//! Execution plan extraction for slow queries.
//!
//! Plans are fetched with `EXPLAIN (FORMAT JSON)` (never `ANALYZE`, so the
//! statement itself is not run) and cached per query fingerprint. When a
//! cached entry expires the query is explained again and a change in plan
//! shape is reported as a regression.

mod model;

pub use model::{BufferCounts, BufferUsage, QueryPlan};

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::PlanExtractorConfig;
use crate::correlator::{QueryCategory, classify_query, fingerprint, normalize_query};
use crate::source::{QueryError, QueryExecutor};

const DEFAULT_MAX_QUERY_TEXT_LEN: usize = 4096;

/// Cost increase (percent) above which a regression is moderate.
const MODERATE_INCREASE_PCT: f64 = 50.0;
/// Cost increase (percent) above which a regression is severe.
const SEVERE_INCREASE_PCT: f64 = 100.0;

#[derive(Debug)]
pub enum PlanError {
    /// The query was not sent to the database.
    Unsafe(&'static str),
    Parse(String),
    Query(QueryError),
    /// The circuit breaker refused the call.
    Rejected,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Unsafe(reason) => write!(f, "query not explainable: {}", reason),
            PlanError::Parse(msg) => write!(f, "plan parse error: {}", msg),
            PlanError::Query(e) => write!(f, "explain failed: {}", e),
            PlanError::Rejected => write!(f, "explain rejected: circuit open"),
        }
    }
}

impl std::error::Error for PlanError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionSeverity {
    Minor,
    Moderate,
    Severe,
}

impl RegressionSeverity {
    pub fn from_increase_pct(pct: f64) -> Self {
        if pct > SEVERE_INCREASE_PCT {
            RegressionSeverity::Severe
        } else if pct > MODERATE_INCREASE_PCT {
            RegressionSeverity::Moderate
        } else {
            RegressionSeverity::Minor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegressionSeverity::Minor => "minor",
            RegressionSeverity::Moderate => "moderate",
            RegressionSeverity::Severe => "severe",
        }
    }
}

/// A query whose plan shape changed since it was last explained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanRegression {
    pub query_fingerprint: String,
    pub old_plan_fingerprint: String,
    pub new_plan_fingerprint: String,
    pub old_cost: f64,
    pub new_cost: f64,
    pub cost_increase_pct: f64,
    pub severity: RegressionSeverity,
    pub changes: Vec<String>,
}

impl PlanRegression {
    fn between(query_fingerprint: &str, old: &CachedPlan, new: &CachedPlan) -> Self {
        let old_cost = old.plan.total_cost();
        let new_cost = new.plan.total_cost();
        let cost_increase_pct = if old_cost > 0.0 {
            (new_cost - old_cost) / old_cost * 100.0
        } else if new_cost > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        Self {
            query_fingerprint: query_fingerprint.to_string(),
            old_plan_fingerprint: old.fingerprint.clone(),
            new_plan_fingerprint: new.fingerprint.clone(),
            old_cost,
            new_cost,
            cost_increase_pct,
            severity: RegressionSeverity::from_increase_pct(cost_increase_pct),
            changes: describe_changes(&old.plan, &new.plan),
        }
    }
}

fn describe_changes(old: &QueryPlan, new: &QueryPlan) -> Vec<String> {
    let mut changes = Vec::new();
    if old.plan_type != new.plan_type {
        changes.push(format!(
            "Root node changed from {} to {}",
            old.plan_type, new.plan_type
        ));
    }
    if new.total_cost() > old.total_cost() * 1.1 {
        changes.push(format!(
            "Cost increased from {:.2} to {:.2}",
            old.total_cost(),
            new.total_cost()
        ));
    }
    let (old_nodes, new_nodes) = (old.node_count(), new.node_count());
    if new_nodes > old_nodes {
        changes.push(format!(
            "Plan nodes increased from {} to {}",
            old_nodes, new_nodes
        ));
    }
    for idx in old.indexes_used() {
        if !new.indexes_used().contains(&idx) {
            changes.push(format!("Index {} no longer used", idx));
        }
    }
    if old.is_parallel() != new.is_parallel() {
        changes.push(if new.is_parallel() {
            "Plan became parallel".to_string()
        } else {
            "Plan is no longer parallel".to_string()
        });
    }
    changes
}

/// Result of a successful lookup.
#[derive(Clone, Debug)]
pub struct PlanOutcome {
    pub plan: Arc<QueryPlan>,
    pub plan_fingerprint: String,
    pub cached: bool,
    pub regression: Option<PlanRegression>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub plans_analyzed: u64,
    pub unsafe_refused: u64,
    pub rejected: u64,
    pub explain_errors: u64,
    pub regressions: u64,
    pub cached_plans: usize,
}

struct CachedPlan {
    plan: Arc<QueryPlan>,
    fingerprint: String,
    explained_at: Instant,
}

/// Query text checked and ready to be explained.
#[derive(Debug, PartialEq)]
pub struct ExplainableQuery {
    pub text: String,
    pub fingerprint: String,
    pub category: QueryCategory,
}

/// Rejects statements that must not be sent to `EXPLAIN`.
///
/// Only plain DML is explained. Parameter placeholders cannot be planned
/// without values and truncated text would not parse.
pub fn prepare_for_explain(
    query: &str,
    max_query_text_len: usize,
) -> Result<ExplainableQuery, PlanError> {
    if query.len() >= max_query_text_len {
        return Err(PlanError::Unsafe("query text truncated"));
    }
    let text = query.trim().trim_end_matches(';').trim_end();
    if text.is_empty() {
        return Err(PlanError::Unsafe("empty query"));
    }
    if has_parameter_placeholder(text) {
        return Err(PlanError::Unsafe("parameter placeholders"));
    }
    if text.contains(';') {
        return Err(PlanError::Unsafe("multiple statements"));
    }

    let normalized =
        normalize_query(text).map_err(|_| PlanError::Unsafe("unparseable query text"))?;
    let category = classify_query(&normalized);
    match category {
        QueryCategory::Select
        | QueryCategory::Insert
        | QueryCategory::Update
        | QueryCategory::Delete => Ok(ExplainableQuery {
            text: text.to_string(),
            fingerprint: fingerprint(&normalized),
            category,
        }),
        QueryCategory::Ddl => Err(PlanError::Unsafe("ddl statement")),
        QueryCategory::Maintenance => Err(PlanError::Unsafe("maintenance statement")),
        QueryCategory::Transaction => Err(PlanError::Unsafe("transaction control")),
        QueryCategory::Utility | QueryCategory::Other => {
            Err(PlanError::Unsafe("utility statement"))
        }
    }
}

/// `$1`-style placeholders. Dollar-quote tags cannot start with a digit.
fn has_parameter_placeholder(text: &str) -> bool {
    text.as_bytes()
        .windows(2)
        .any(|w| w[0] == b'$' && w[1].is_ascii_digit())
}

/// Entry is stale once `ttl` has elapsed since it was explained.
pub fn cache_entry_expired(explained_at: Instant, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(explained_at) >= ttl
}

pub struct PlanExtractor<E: QueryExecutor> {
    executor: Mutex<E>,
    breaker: Arc<CircuitBreaker>,
    config: PlanExtractorConfig,
    max_query_text_len: usize,
    /// Database the executor is connected to.
    database: Option<String>,
    cache: Mutex<LruCache<String, CachedPlan>>,
    stats: Mutex<PlanStats>,
}

impl<E: QueryExecutor> PlanExtractor<E> {
    pub fn new(executor: E, breaker: Arc<CircuitBreaker>, config: PlanExtractorConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            executor: Mutex::new(executor),
            breaker,
            config,
            max_query_text_len: DEFAULT_MAX_QUERY_TEXT_LEN,
            database: None,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(PlanStats::default()),
        }
    }

    /// Text at or over this length is treated as truncated by the sampler.
    ///
    /// A smaller limit reported by the executor takes precedence.
    pub fn with_max_query_text_len(mut self, len: usize) -> Self {
        self.max_query_text_len = len;
        self
    }

    /// Restricts [`explain_in`](Self::explain_in) to statements seen in `database`.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> PlanStats {
        let mut stats = self.stats.lock().clone();
        stats.cached_plans = self.cache.lock().len();
        stats
    }

    /// Returns the plan for `query`, from cache when fresh.
    pub fn explain(&self, query: &str) -> Result<PlanOutcome, PlanError> {
        self.explain_at(query, Instant::now())
    }

    /// Like [`explain`](Self::explain) for a statement that ran in `database`.
    ///
    /// Statements from another database are refused: their relations are
    /// not visible to this connection.
    pub fn explain_in(&self, database: &str, query: &str) -> Result<PlanOutcome, PlanError> {
        if let Some(connected) = self.database.as_deref()
            && connected != database
        {
            let mut stats = self.stats.lock();
            stats.requests += 1;
            stats.unsafe_refused += 1;
            debug!(database, connected, "plan extraction skipped, other database");
            return Err(PlanError::Unsafe("other database"));
        }
        self.explain(query)
    }

    /// Effective truncation limit: the configured one or the server's, if smaller.
    fn query_text_limit(&self) -> usize {
        match self.executor.lock().query_text_limit() {
            Some(server) => self.max_query_text_len.min(server),
            None => self.max_query_text_len,
        }
    }

    pub(crate) fn explain_at(&self, query: &str, now: Instant) -> Result<PlanOutcome, PlanError> {
        self.stats.lock().requests += 1;

        let prepared = match prepare_for_explain(query, self.query_text_limit()) {
            Ok(p) => p,
            Err(e) => {
                self.stats.lock().unsafe_refused += 1;
                debug!(error = %e, "plan extraction skipped");
                return Err(e);
            }
        };

        // Expired entries are kept until replaced so the new plan can be
        // compared against them.
        let previous = {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&prepared.fingerprint)
                && !cache_entry_expired(entry.explained_at, now, self.config.cache_ttl)
            {
                self.stats.lock().cache_hits += 1;
                return Ok(PlanOutcome {
                    plan: Arc::clone(&entry.plan),
                    plan_fingerprint: entry.fingerprint.clone(),
                    cached: true,
                    regression: None,
                });
            }
            cache.pop(&prepared.fingerprint)
        };
        self.stats.lock().cache_misses += 1;

        let started = Instant::now();
        let timeout = self.config.plan_timeout;
        let json = self
            .breaker
            .call(|| self.executor.lock().explain_query(&prepared.text, timeout))
            .map_err(|e| {
                let mut stats = self.stats.lock();
                match e {
                    BreakerError::Open => {
                        stats.rejected += 1;
                        PlanError::Rejected
                    }
                    BreakerError::Inner(err) => {
                        stats.explain_errors += 1;
                        warn!(operation = "explain", query_fingerprint = %prepared.fingerprint,
                            duration_ms = started.elapsed().as_millis() as u64,
                            error = %err, "plan extraction failed");
                        PlanError::Query(err)
                    }
                }
            })?;

        let plan = QueryPlan::parse_explain_json(&json).inspect_err(|e| {
            self.stats.lock().explain_errors += 1;
            warn!(query_fingerprint = %prepared.fingerprint, error = %e, "unreadable plan");
        })?;

        let entry = CachedPlan {
            fingerprint: plan.fingerprint(),
            plan: Arc::new(plan),
            explained_at: now,
        };

        let regression = previous
            .filter(|old| old.fingerprint != entry.fingerprint)
            .map(|old| PlanRegression::between(&prepared.fingerprint, &old, &entry));

        {
            let mut stats = self.stats.lock();
            stats.plans_analyzed += 1;
            if regression.is_some() {
                stats.regressions += 1;
            }
        }
        if let Some(r) = &regression {
            warn!(query_fingerprint = %r.query_fingerprint,
                old_plan = %r.old_plan_fingerprint, new_plan = %r.new_plan_fingerprint,
                cost_increase_pct = r.cost_increase_pct, severity = r.severity.as_str(),
                "plan changed");
        }
        debug!(query_fingerprint = %prepared.fingerprint, plan_fingerprint = %entry.fingerprint,
            total_cost = entry.plan.total_cost(),
            duration_ms = started.elapsed().as_millis() as u64, "plan extracted");

        let outcome = PlanOutcome {
            plan: Arc::clone(&entry.plan),
            plan_fingerprint: entry.fingerprint.clone(),
            cached: false,
            regression,
        };
        self.cache.lock().put(prepared.fingerprint, entry);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use crate::source::mock::{MockExecutor, SIMPLE_PLAN_JSON};

    const SLOW_QUERY: &str =
        "SELECT * FROM orders o JOIN customers c ON c.id = o.customer_id WHERE o.total > 100";

    fn extractor(mock: &MockExecutor) -> PlanExtractor<MockExecutor> {
        PlanExtractor::new(
            mock.clone(),
            Arc::new(CircuitBreaker::new("plan", CircuitBreakerConfig::default())),
            PlanExtractorConfig::default(),
        )
    }

    #[test]
    fn refuses_unsafe_statements() {
        for query in [
            "CREATE TABLE t (id int)",
            "DROP TABLE t",
            "VACUUM orders",
            "BEGIN",
            "SET work_mem = '64MB'",
            "SELECT * FROM t WHERE id = $1",
            "SELECT 1; DELETE FROM t",
            "",
        ] {
            assert!(
                matches!(prepare_for_explain(query, 4096), Err(PlanError::Unsafe(_))),
                "{query} should be refused"
            );
        }
    }

    #[test]
    fn refuses_truncated_text() {
        let query = format!("SELECT * FROM t WHERE name = '{}'", "x".repeat(100));
        assert!(prepare_for_explain(&query, query.len()).is_err());
        assert!(prepare_for_explain(&query, query.len() + 1).is_ok());
    }

    #[test]
    fn accepts_dml_and_strips_terminator() {
        let q = prepare_for_explain("UPDATE t SET a = 1 WHERE id = 2;", 4096).unwrap();
        assert_eq!(q.text, "UPDATE t SET a = 1 WHERE id = 2");
        assert_eq!(q.category, QueryCategory::Update);
        // dollar quotes are not placeholders
        assert!(prepare_for_explain("SELECT $tag$x$tag$", 4096).is_ok());
    }

    #[test]
    fn unsafe_query_does_not_touch_database_or_breaker() {
        let mock = MockExecutor::new();
        let ex = extractor(&mock);
        assert!(matches!(ex.explain("TRUNCATE orders"), Err(PlanError::Unsafe(_))));
        assert_eq!(mock.explain_calls(), 0);
        assert_eq!(ex.breaker().stats().failures, 0);
        assert_eq!(ex.stats().unsafe_refused, 1);
    }

    #[test]
    fn caches_by_query_fingerprint() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        let ex = extractor(&mock);

        let first = ex.explain(SLOW_QUERY).unwrap();
        assert!(!first.cached);
        assert_eq!(first.plan.plan_type, "Hash Join");

        // different literal, same fingerprint
        let second = ex.explain(&SLOW_QUERY.replace("100", "250")).unwrap();
        assert!(second.cached);
        assert_eq!(second.plan_fingerprint, first.plan_fingerprint);
        assert_eq!(mock.explain_calls(), 1);
        assert_eq!(mock.last_timeout(), Some(Duration::from_secs(5)));

        let stats = ex.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cached_plans, 1);
    }

    #[test]
    fn expired_entry_with_new_shape_reports_regression() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        let ex = extractor(&mock);
        let t0 = Instant::now();
        ex.explain_at(SLOW_QUERY, t0).unwrap();

        let worse = SIMPLE_PLAN_JSON
            .replace("\"Index Scan\"", "\"Seq Scan\"")
            .replace("\"Index Name\": \"customers_pkey\",", "")
            .replace("245.75", "600.0");
        mock.set_explain(worse);

        let within_ttl = ex.explain_at(SLOW_QUERY, t0 + Duration::from_secs(60)).unwrap();
        assert!(within_ttl.cached);

        let later = ex.explain_at(SLOW_QUERY, t0 + Duration::from_secs(601)).unwrap();
        let regression = later.regression.expect("plan shape changed");
        assert_eq!(regression.severity, RegressionSeverity::Severe);
        assert!(regression.cost_increase_pct > 100.0);
        assert!(
            regression
                .changes
                .iter()
                .any(|c| c.starts_with("Cost increased from 245.75"))
        );
        assert!(
            regression
                .changes
                .contains(&"Index customers_pkey no longer used".to_string())
        );
        assert_eq!(ex.stats().regressions, 1);
    }

    #[test]
    fn unchanged_shape_after_expiry_is_not_a_regression() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        let ex = extractor(&mock);
        let t0 = Instant::now();
        ex.explain_at(SLOW_QUERY, t0).unwrap();
        let again = ex.explain_at(SLOW_QUERY, t0 + Duration::from_secs(3600)).unwrap();
        assert!(!again.cached);
        assert!(again.regression.is_none());
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(RegressionSeverity::from_increase_pct(-20.0), RegressionSeverity::Minor);
        assert_eq!(RegressionSeverity::from_increase_pct(50.0), RegressionSeverity::Minor);
        assert_eq!(RegressionSeverity::from_increase_pct(75.0), RegressionSeverity::Moderate);
        assert_eq!(RegressionSeverity::from_increase_pct(100.0), RegressionSeverity::Moderate);
        assert_eq!(RegressionSeverity::from_increase_pct(100.1), RegressionSeverity::Severe);
    }

    #[test]
    fn explain_failures_open_the_breaker() {
        let mock = MockExecutor::new();
        mock.fail_explain(QueryError::Timeout("canceling statement".to_string()));
        let ex = extractor(&mock);

        for i in 0..5 {
            let q = format!("SELECT * FROM t{} WHERE id = 1", i);
            assert!(matches!(ex.explain(&q), Err(PlanError::Query(_))));
        }
        assert_eq!(ex.breaker().state(), CircuitState::Open);
        assert!(matches!(
            ex.explain("SELECT * FROM t9 WHERE id = 1"),
            Err(PlanError::Rejected)
        ));
        assert_eq!(mock.explain_calls(), 5);
        let stats = ex.stats();
        assert_eq!(stats.explain_errors, 5);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn unreadable_plan_is_a_parse_error() {
        let mock = MockExecutor::new();
        mock.set_explain("[{\"NoPlan\": {}}]");
        let ex = extractor(&mock);
        assert!(matches!(ex.explain(SLOW_QUERY), Err(PlanError::Parse(_))));
        assert_eq!(ex.stats().cached_plans, 0);
    }

    #[test]
    fn other_database_is_refused_before_the_breaker() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        let ex = extractor(&mock).with_database("app");

        for _ in 0..10 {
            assert!(matches!(
                ex.explain_in("analytics", SLOW_QUERY),
                Err(PlanError::Unsafe("other database"))
            ));
        }
        assert_eq!(mock.explain_calls(), 0);
        assert_eq!(ex.breaker().stats().failures, 0);
        assert_eq!(ex.stats().unsafe_refused, 10);

        assert!(!ex.explain_in("app", SLOW_QUERY).unwrap().cached);
        assert_eq!(mock.explain_calls(), 1);
    }

    #[test]
    fn server_truncation_limit_wins_when_smaller() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        mock.set_query_text_limit(Some(64));
        let ex = extractor(&mock);

        let cut = format!("SELECT * FROM orders WHERE note = '{}", "x".repeat(100));
        let cut = &cut[..64];
        assert!(matches!(
            ex.explain(cut),
            Err(PlanError::Unsafe("query text truncated"))
        ));
        assert_eq!(mock.explain_calls(), 0);
        assert_eq!(ex.breaker().stats().failures, 0);

        // short statements still go through
        assert!(ex.explain("SELECT * FROM orders WHERE id = 1").is_ok());
        assert_eq!(mock.explain_calls(), 1);
    }

    #[test]
    fn lru_keeps_cache_bounded() {
        let mock = MockExecutor::new();
        mock.set_explain(SIMPLE_PLAN_JSON);
        let ex = PlanExtractor::new(
            mock.clone(),
            Arc::new(CircuitBreaker::new("plan", CircuitBreakerConfig::default())),
            PlanExtractorConfig {
                cache_size: 2,
                ..Default::default()
            },
        );
        for table in ["a", "b", "c"] {
            ex.explain(&format!("SELECT * FROM {}", table)).unwrap();
        }
        assert_eq!(ex.stats().cached_plans, 2);
        // "a" was evicted and must be explained again
        assert!(!ex.explain("SELECT * FROM a").unwrap().cached);
        assert_eq!(mock.explain_calls(), 4);
    }
}
