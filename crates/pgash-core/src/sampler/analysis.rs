//! Aggregations over buffered samples.
//!
//! Times are approximate: each observation stands for one collection interval.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::model::SessionSample;

/// Aggregated view of one `type:event` wait.
#[derive(Clone, Debug, PartialEq)]
pub struct WaitEventSummary {
    /// `"<wait_event_type>:<wait_event>"`.
    pub event: String,
    pub count: u64,
    pub sessions: usize,
    pub queries: usize,
    pub approx_wait: Duration,
}

/// Sessions blocked by one blocker.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockingSummary {
    pub blocker_session_id: String,
    pub blocked_sessions: usize,
    pub observations: u64,
    pub blocker_query: Option<String>,
    pub blocker_username: Option<String>,
    pub blocker_state: Option<String>,
    pub approx_blocked_time: Duration,
}

/// Groups waiting samples by wait event, most frequent first.
pub fn wait_event_summary<I, S>(samples: I, interval: Duration) -> Vec<WaitEventSummary>
where
    I: IntoIterator<Item = S>,
    S: Borrow<SessionSample>,
{
    #[derive(Default)]
    struct Acc {
        count: u64,
        sessions: HashSet<String>,
        queries: HashSet<String>,
    }

    let mut by_event: HashMap<String, Acc> = HashMap::new();
    for sample in samples {
        let s = sample.borrow();
        let Some(event) = s.wait_event.as_deref().filter(|e| !e.is_empty()) else {
            continue;
        };
        let key = format!("{}:{}", s.wait_event_type.as_deref().unwrap_or(""), event);
        let acc = by_event.entry(key).or_default();
        acc.count += 1;
        acc.sessions.insert(s.session_id.clone());
        if let Some(q) = &s.query_text {
            acc.queries.insert(q.clone());
        }
    }

    let mut out: Vec<WaitEventSummary> = by_event
        .into_iter()
        .map(|(event, acc)| WaitEventSummary {
            event,
            count: acc.count,
            sessions: acc.sessions.len(),
            queries: acc.queries.len(),
            approx_wait: interval.saturating_mul(acc.count.min(u32::MAX as u64) as u32),
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.event.cmp(&b.event)));
    out
}

/// Groups blocked samples by blocker, most blocked sessions first.
///
/// Blocker details come from the latest sample of the blocker itself when it is
/// in the input, otherwise from the blocked sample's copy of the blocker query.
pub fn blocking_summary<I, S>(samples: I, interval: Duration) -> Vec<BlockingSummary>
where
    I: IntoIterator<Item = S>,
    S: Borrow<SessionSample>,
{
    struct Acc {
        blocked: HashSet<String>,
        observations: u64,
        query: Option<String>,
    }

    let mut latest: HashMap<String, (Option<String>, String, String)> = HashMap::new();
    let mut by_blocker: HashMap<String, Acc> = HashMap::new();

    for sample in samples {
        let s = sample.borrow();
        latest.insert(
            s.session_id.clone(),
            (
                s.query_text.clone(),
                s.username.clone(),
                s.state.as_str().to_string(),
            ),
        );
        let Some(blocker) = s.blocking_session_id.as_deref().filter(|b| !b.is_empty()) else {
            continue;
        };
        let acc = by_blocker.entry(blocker.to_string()).or_insert_with(|| Acc {
            blocked: HashSet::new(),
            observations: 0,
            query: None,
        });
        acc.blocked.insert(s.session_id.clone());
        acc.observations += 1;
        if s.blocking_query_text.is_some() {
            acc.query = s.blocking_query_text.clone();
        }
    }

    let mut out: Vec<BlockingSummary> = by_blocker
        .into_iter()
        .map(|(blocker, acc)| {
            let own = latest.get(&blocker);
            BlockingSummary {
                blocker_query: own.and_then(|o| o.0.clone()).or(acc.query),
                blocker_username: own.map(|o| o.1.clone()),
                blocker_state: own.map(|o| o.2.clone()),
                blocked_sessions: acc.blocked.len(),
                observations: acc.observations,
                approx_blocked_time: interval
                    .saturating_mul(acc.observations.min(u32::MAX as u64) as u32),
                blocker_session_id: blocker,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.blocked_sessions
            .cmp(&a.blocked_sessions)
            .then_with(|| a.blocker_session_id.cmp(&b.blocker_session_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SessionRow;
    use crate::source::mock::blocking_chain;
    use chrono::DateTime;

    const NOW: i64 = 1_700_000_000_000;

    fn samples(rows: Vec<SessionRow>) -> Vec<SessionSample> {
        let fallback = DateTime::from_timestamp_millis(NOW).unwrap();
        rows.into_iter()
            .map(|r| r.into_sample(fallback, 4096).unwrap())
            .collect()
    }

    #[test]
    fn wait_events_grouped_by_type_and_event() {
        let rows = vec![
            SessionRow::active(1, "SELECT 1", NOW).waiting("IO", "DataFileRead"),
            SessionRow::active(2, "SELECT 2", NOW).waiting("IO", "DataFileRead"),
            SessionRow::active(1, "SELECT 1", NOW + 1_000).waiting("IO", "DataFileRead"),
            SessionRow::active(3, "SELECT 3", NOW).waiting("LWLock", "WALWrite"),
            SessionRow::active(4, "SELECT 4", NOW),
        ];
        let summary = wait_event_summary(samples(rows), Duration::from_secs(1));
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].event, "IO:DataFileRead");
        assert_eq!(summary[0].count, 3);
        // the scenario builder derives backend_start from now, so pid 1 shows up twice
        assert_eq!(summary[0].sessions, 3);
        assert_eq!(summary[0].queries, 2);
        assert_eq!(summary[0].approx_wait, Duration::from_secs(3));
    }

    #[test]
    fn blocking_summary_uses_blocker_sample() {
        let summary = blocking_summary(samples(blocking_chain(NOW)), Duration::from_secs(1));
        assert_eq!(summary.len(), 1);
        let b = &summary[0];
        assert_eq!(b.blocked_sessions, 2);
        assert_eq!(b.blocker_state.as_deref(), Some("active"));
        assert_eq!(b.blocker_username.as_deref(), Some("app_user"));
        assert!(b.blocker_query.as_deref().unwrap().starts_with("UPDATE accounts"));
        assert_eq!(b.approx_blocked_time, Duration::from_secs(2));
    }

    #[test]
    fn blocking_summary_falls_back_to_blocked_copy() {
        let rows = vec![SessionRow::active(9, "DELETE FROM t", NOW).blocked_by(
            77,
            NOW - 1_000,
            "LOCK TABLE t",
        )];
        let summary = blocking_summary(samples(rows), Duration::from_secs(1));
        assert_eq!(summary[0].blocker_query.as_deref(), Some("LOCK TABLE t"));
        assert_eq!(summary[0].blocker_username, None);
    }
}
