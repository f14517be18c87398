//! Query correlator: windowed grouping and enrichment of admitted samples.
//!
//! Samples are grouped by a correlation key: the server's `query_id` when
//! present, otherwise the fingerprint of the normalized query text. Each
//! group lives for `correlation_window` from its creation; expired groups are
//! evicted lazily as newer samples arrive, and a later occurrence starts a
//! fresh group.

mod normalize;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use normalize::{
    NormalizeError, QueryCategory, classify_query, fingerprint, normalize_query,
};

use crate::config::CorrelatorConfig;
use crate::model::SessionSample;

/// Mean duration above which a group counts as slow.
const SLOW_MEAN_MS: f64 = 1000.0;
/// Mean duration above which a group counts as moderate.
const MODERATE_MEAN_MS: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceCategory {
    Fast,
    Moderate,
    Slow,
}

impl PerformanceCategory {
    pub fn from_mean_ms(mean_ms: f64) -> Self {
        if mean_ms > SLOW_MEAN_MS {
            PerformanceCategory::Slow
        } else if mean_ms > MODERATE_MEAN_MS {
            PerformanceCategory::Moderate
        } else {
            PerformanceCategory::Fast
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceCategory::Fast => "fast",
            PerformanceCategory::Moderate => "moderate",
            PerformanceCategory::Slow => "slow",
        }
    }
}

/// Samples sharing a correlation key within one window.
#[derive(Clone, Debug)]
pub struct CorrelationGroup {
    pub id: u64,
    pub key: String,
    /// Fingerprint of the normalized text, if any sample carried text.
    pub fingerprint: Option<String>,
    pub category: Option<QueryCategory>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    pub slow_occurrences: u64,
    /// Occurrences with a defined query duration.
    pub timed_occurrences: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    /// Keys of queries seen blocking or blocked by this one. Distinct, capped.
    pub correlated: Vec<String>,
}

impl CorrelationGroup {
    fn new(id: u64, key: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            key,
            fingerprint: None,
            category: None,
            created_at: now,
            last_seen: now,
            occurrences: 0,
            slow_occurrences: 0,
            timed_occurrences: 0,
            total_duration_ms: 0,
            max_duration_ms: 0,
            correlated: Vec::new(),
        }
    }

    pub fn mean_duration_ms(&self) -> Option<f64> {
        (self.timed_occurrences > 0)
            .then(|| self.total_duration_ms as f64 / self.timed_occurrences as f64)
    }

    pub fn performance_category(&self) -> Option<PerformanceCategory> {
        self.mean_duration_ms().map(PerformanceCategory::from_mean_ms)
    }

    fn add_correlated(&mut self, key: &str, cap: usize) {
        if key == self.key || self.correlated.len() >= cap {
            return;
        }
        if !self.correlated.iter().any(|k| k == key) {
            self.correlated.push(key.to_string());
        }
    }
}

/// Enrichment attached to one sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Correlation {
    pub key: Option<String>,
    pub group_id: Option<u64>,
    pub category: Option<QueryCategory>,
    pub is_slow: bool,
    pub is_frequent: bool,
    pub performance_category: Option<PerformanceCategory>,
    pub correlated_queries: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrelatorStats {
    pub samples: u64,
    pub uncorrelated: u64,
    pub normalize_failures: u64,
    pub groups_created: u64,
    pub groups_expired: u64,
    pub groups_evicted: u64,
    pub active_groups: usize,
}

pub struct QueryCorrelator {
    config: CorrelatorConfig,
    window: ChronoDuration,
    groups: HashMap<String, CorrelationGroup>,
    /// (created_at, key, group id) in creation order.
    expiry: VecDeque<(DateTime<Utc>, String, u64)>,
    /// Text fingerprint to the key of the group that last carried it.
    by_fingerprint: HashMap<String, String>,
    next_group_id: u64,
    stats: CorrelatorStats,
}

fn query_id_key(id: i64) -> String {
    format!("qid:{}", id)
}

fn fingerprint_key(fp: &str) -> String {
    format!("fp:{}", fp)
}

impl QueryCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        let window =
            ChronoDuration::from_std(config.correlation_window).unwrap_or(ChronoDuration::MAX);
        Self {
            config,
            window,
            groups: HashMap::new(),
            expiry: VecDeque::new(),
            by_fingerprint: HashMap::new(),
            next_group_id: 1,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn group(&self, key: &str) -> Option<&CorrelationGroup> {
        self.groups.get(key)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            active_groups: self.groups.len(),
            ..self.stats.clone()
        }
    }

    /// Removes the group behind the front expiry entry, if still live.
    fn pop_front_group(&mut self) -> bool {
        let Some((_, key, id)) = self.expiry.pop_front() else {
            return false;
        };
        if self.groups.get(&key).is_some_and(|g| g.id == id) {
            if let Some(group) = self.groups.remove(&key)
                && let Some(fp) = group.fingerprint
                && self.by_fingerprint.get(&fp) == Some(&key)
            {
                self.by_fingerprint.remove(&fp);
            }
            return true;
        }
        false
    }

    /// Evicts groups whose window has fully elapsed at `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        while let Some((created, _, _)) = self.expiry.front() {
            let Some(deadline) = created.checked_add_signed(self.window) else {
                break;
            };
            if deadline > now {
                break;
            }
            if self.pop_front_group() {
                expired += 1;
            }
        }
        if expired > 0 {
            self.stats.groups_expired += expired as u64;
            trace!(expired, remaining = self.groups.len(), "correlation groups expired");
        }
        expired
    }

    /// Key for a blocker known only by its query text.
    fn blocker_key(&self, text: &str) -> Option<String> {
        let fp = fingerprint(&normalize_query(text).ok()?);
        Some(
            self.by_fingerprint
                .get(&fp)
                .cloned()
                .unwrap_or_else(|| fingerprint_key(&fp)),
        )
    }

    /// Correlates one admitted sample and returns its enrichment.
    pub fn correlate(&mut self, sample: &SessionSample) -> Correlation {
        self.stats.samples += 1;
        let now = sample.timestamp;
        self.evict_expired(now);

        let duration_ms = sample.query_duration().map(|_| sample.query_duration_ms());
        let is_slow = duration_ms.is_some_and(|d| d > self.config.slow_query_threshold_ms);

        let normalized = match sample.query_text.as_deref() {
            Some(text) => match normalize_query(text) {
                Ok(n) => Some(n),
                Err(e) => {
                    self.stats.normalize_failures += 1;
                    debug!(session_id = %sample.session_id, error = %e,
                        "query text not normalizable, no category");
                    None
                }
            },
            None => None,
        };
        let fp = normalized.as_deref().map(fingerprint);
        let category = normalized.as_deref().map(classify_query);

        let key = match (sample.query_id, &fp) {
            (Some(id), _) if id != 0 => query_id_key(id),
            (_, Some(fp)) => fingerprint_key(fp),
            _ => {
                self.stats.uncorrelated += 1;
                return Correlation {
                    category,
                    is_slow,
                    ..Default::default()
                };
            }
        };

        if !self.groups.contains_key(&key) {
            while self.groups.len() >= self.config.max_groups.max(1) {
                if self.expiry.is_empty() {
                    break;
                }
                if self.pop_front_group() {
                    self.stats.groups_evicted += 1;
                }
            }
            let id = self.next_group_id;
            self.next_group_id += 1;
            self.groups
                .insert(key.clone(), CorrelationGroup::new(id, key.clone(), now));
            self.expiry.push_back((now, key.clone(), id));
            self.stats.groups_created += 1;
        }

        let blocker_key = if sample.is_blocked() {
            sample
                .blocking_query_text
                .as_deref()
                .and_then(|t| self.blocker_key(t))
        } else {
            None
        };
        let cap = self.config.max_correlated_queries;

        if let Some(fp) = &fp {
            self.by_fingerprint.insert(fp.clone(), key.clone());
        }

        if let Some(bkey) = &blocker_key
            && let Some(blocker) = self.groups.get_mut(bkey)
        {
            blocker.add_correlated(&key, cap);
        }

        let Some(group) = self.groups.get_mut(&key) else {
            return Correlation {
                key: Some(key),
                category,
                is_slow,
                ..Default::default()
            };
        };
        group.last_seen = group.last_seen.max(now);
        group.occurrences += 1;
        if is_slow {
            group.slow_occurrences += 1;
        }
        if let Some(d) = duration_ms {
            group.timed_occurrences += 1;
            group.total_duration_ms += d;
            group.max_duration_ms = group.max_duration_ms.max(d);
        }
        if fp.is_some() {
            group.fingerprint = fp;
        }
        if category.is_some() {
            group.category = category;
        }
        if let Some(bkey) = &blocker_key {
            group.add_correlated(bkey, cap);
        }

        Correlation {
            key: Some(key),
            group_id: Some(group.id),
            category: category.or(group.category),
            is_slow,
            is_frequent: group.occurrences > self.config.frequent_query_threshold,
            performance_category: group.performance_category(),
            correlated_queries: group.correlated.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SessionRow;
    use crate::source::mock::blocking_chain;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn config() -> CorrelatorConfig {
        CorrelatorConfig::default()
    }

    fn sample(row: SessionRow) -> SessionSample {
        row.into_sample(DateTime::from_timestamp_millis(T0).unwrap(), 4096)
            .unwrap()
    }

    #[test]
    fn same_text_within_window_joins_group() {
        let mut c = QueryCorrelator::new(config());
        let a = c.correlate(&sample(SessionRow::active(1, "SELECT * FROM t WHERE id = 1", T0)));
        let b = c.correlate(&sample(SessionRow::active(
            2,
            "select * from t where id = 99",
            T0 + 60_000,
        )));
        assert_eq!(a.group_id, b.group_id);
        assert!(a.key.as_deref().unwrap().starts_with("fp:"));
        assert_eq!(b.category, Some(QueryCategory::Select));
        assert_eq!(c.group_count(), 1);
    }

    #[test]
    fn query_id_takes_precedence_over_text() {
        let mut c = QueryCorrelator::new(config());
        let a = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0).with_query_id(7)));
        let b = c.correlate(&sample(SessionRow::active(2, "SELECT 2 + 2", T0).with_query_id(7)));
        assert_eq!(a.key.as_deref(), Some("qid:7"));
        assert_eq!(a.group_id, b.group_id);
    }

    #[test]
    fn window_expiry_starts_fresh_group() {
        let mut c = QueryCorrelator::new(CorrelatorConfig {
            correlation_window: Duration::from_secs(60),
            ..config()
        });
        let a = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0)));
        let b = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0 + 59_000)));
        let later = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0 + 60_000)));
        assert_eq!(a.group_id, b.group_id);
        assert_ne!(a.group_id, later.group_id);
        assert_eq!(c.stats().groups_expired, 1);
        assert_eq!(c.group(a.key.as_deref().unwrap()).unwrap().occurrences, 1);
    }

    #[test]
    fn slow_and_frequent_flags() {
        let mut c = QueryCorrelator::new(CorrelatorConfig {
            frequent_query_threshold: 3,
            ..config()
        });
        let fast = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0)));
        assert!(!fast.is_slow);
        assert!(!fast.is_frequent);
        assert_eq!(fast.performance_category, Some(PerformanceCategory::Fast));

        let slow = c.correlate(&sample(
            SessionRow::active(2, "SELECT 1", T0).running_for(5_000),
        ));
        assert!(slow.is_slow);

        c.correlate(&sample(SessionRow::active(3, "SELECT 1", T0)));
        let fourth = c.correlate(&sample(SessionRow::active(4, "SELECT 1", T0)));
        assert!(fourth.is_frequent);
        // mean of 10, 5000, 10, 10 ms
        assert_eq!(fourth.performance_category, Some(PerformanceCategory::Slow));
    }

    #[test]
    fn idle_samples_do_not_skew_duration() {
        let mut c = QueryCorrelator::new(config());
        c.correlate(&sample(SessionRow::active(1, "SELECT pg_sleep(2)", T0).running_for(2_000)));
        let idle = c.correlate(&sample(SessionRow::idle(2, T0)));
        assert!(!idle.is_slow);
        let again = c.correlate(&sample(SessionRow::idle(3, T0)));
        assert_eq!(again.group_id, idle.group_id);
        assert_eq!(again.performance_category, None);
    }

    #[test]
    fn blocking_pairs_are_cross_referenced() {
        let mut c = QueryCorrelator::new(config());
        let rows = blocking_chain(T0);
        let holder = c.correlate(&sample(rows[0].clone()));
        let waiter = c.correlate(&sample(rows[1].clone()));

        let holder_key = holder.key.unwrap();
        let waiter_key = waiter.key.unwrap();
        // blocker resolved through its text fingerprint to its query_id group
        assert_eq!(waiter.correlated_queries, vec![holder_key.clone()]);
        assert_eq!(
            c.group(&holder_key).unwrap().correlated,
            vec![waiter_key.clone()]
        );

        let second = c.correlate(&sample(rows[2].clone()));
        assert_eq!(second.group_id, waiter.group_id);
        assert_eq!(second.correlated_queries, vec![holder_key.clone()]);
        assert_eq!(c.group(&holder_key).unwrap().correlated, vec![waiter_key]);
    }

    #[test]
    fn correlated_list_is_capped() {
        let mut c = QueryCorrelator::new(CorrelatorConfig {
            max_correlated_queries: 2,
            ..config()
        });
        for i in 0..5 {
            let row = SessionRow::active(10, "UPDATE t SET a = 1", T0).blocked_by(
                100 + i,
                T0,
                &format!("DELETE FROM t{}", i),
            );
            c.correlate(&sample(row));
        }
        let key = fingerprint_key(&fingerprint("update t set a = ?"));
        assert_eq!(c.group(&key).unwrap().correlated.len(), 2);
    }

    #[test]
    fn max_groups_evicts_oldest() {
        let mut c = QueryCorrelator::new(CorrelatorConfig {
            max_groups: 2,
            ..config()
        });
        let first = c.correlate(&sample(SessionRow::active(1, "SELECT 1", T0).with_query_id(1)));
        c.correlate(&sample(SessionRow::active(2, "SELECT 1", T0).with_query_id(2)));
        c.correlate(&sample(SessionRow::active(3, "SELECT 1", T0).with_query_id(3)));
        assert_eq!(c.group_count(), 2);
        assert!(c.group(first.key.as_deref().unwrap()).is_none());
        assert_eq!(c.stats().groups_evicted, 1);
    }

    #[test]
    fn malformed_text_degrades_to_no_category() {
        let mut c = QueryCorrelator::new(config());
        let r = c.correlate(&sample(SessionRow::active(1, "SELECT 'unterminated", T0)));
        assert_eq!(r.category, None);
        assert_eq!(r.key, None);
        assert_eq!(c.stats().normalize_failures, 1);

        let with_id = c.correlate(&sample(
            SessionRow::active(1, "SELECT 'unterminated", T0).with_query_id(5),
        ));
        assert_eq!(with_id.key.as_deref(), Some("qid:5"));
        assert_eq!(with_id.category, None);
    }
}
