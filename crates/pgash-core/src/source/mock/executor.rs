//! Scripted [`QueryExecutor`] for testing the sampler and pipeline without a database.
//!
//! Clones share state, so a test can keep a handle while the executor itself
//! moves into the sampler thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::source::{QueryError, QueryExecutor, SessionRow};

#[derive(Debug, Default)]
struct MockState {
    /// Responses returned by `query_sessions`, in order.
    session_script: VecDeque<Result<Vec<SessionRow>, QueryError>>,
    /// Returned once the script is exhausted.
    default_sessions: Vec<SessionRow>,
    /// Returned by every `explain_query`.
    explain_response: Option<Result<String, QueryError>>,
    query_text_limit: Option<usize>,
    session_calls: usize,
    explain_calls: usize,
    executed: Vec<String>,
    last_timeout: Option<Duration>,
}

/// Scripted in-memory executor.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    /// Creates an executor that returns no sessions and fails EXPLAIN.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one successful session query result.
    pub fn push_sessions(&self, rows: Vec<SessionRow>) {
        self.state.lock().session_script.push_back(Ok(rows));
    }

    /// Queues one failing session query.
    pub fn push_failure(&self, err: QueryError) {
        self.state.lock().session_script.push_back(Err(err));
    }

    /// Rows returned once the queued script is exhausted.
    pub fn set_default_sessions(&self, rows: Vec<SessionRow>) {
        self.state.lock().default_sessions = rows;
    }

    /// Sets the EXPLAIN output returned for every query.
    pub fn set_explain(&self, json: impl Into<String>) {
        self.state.lock().explain_response = Some(Ok(json.into()));
    }

    /// Makes every EXPLAIN fail with `err`.
    pub fn fail_explain(&self, err: QueryError) {
        self.state.lock().explain_response = Some(Err(err));
    }

    /// Server-side query text limit reported to callers.
    pub fn set_query_text_limit(&self, limit: Option<usize>) {
        self.state.lock().query_text_limit = limit;
    }

    pub fn session_calls(&self) -> usize {
        self.state.lock().session_calls
    }

    pub fn explain_calls(&self) -> usize {
        self.state.lock().explain_calls
    }

    /// Statements passed to `execute`, in call order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Timeout passed with the most recent call.
    pub fn last_timeout(&self) -> Option<Duration> {
        self.state.lock().last_timeout
    }
}

impl QueryExecutor for MockExecutor {
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<u64, QueryError> {
        let mut state = self.state.lock();
        state.last_timeout = Some(timeout);
        state.executed.push(sql.to_string());
        Ok(0)
    }

    fn query_row(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<Option<String>>>, QueryError> {
        let mut state = self.state.lock();
        state.last_timeout = Some(timeout);
        state.executed.push(sql.to_string());
        Ok(Some(vec![Some("170000".to_string())]))
    }

    fn query_sessions(&mut self, timeout: Duration) -> Result<Vec<SessionRow>, QueryError> {
        let mut state = self.state.lock();
        state.session_calls += 1;
        state.last_timeout = Some(timeout);
        match state.session_script.pop_front() {
            Some(response) => response,
            None => Ok(state.default_sessions.clone()),
        }
    }

    fn explain_query(&mut self, _query: &str, timeout: Duration) -> Result<String, QueryError> {
        let mut state = self.state.lock();
        state.explain_calls += 1;
        state.last_timeout = Some(timeout);
        state
            .explain_response
            .clone()
            .unwrap_or_else(|| Err(QueryError::Query("no plan configured".to_string())))
    }

    fn query_text_limit(&self) -> Option<usize> {
        self.state.lock().query_text_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_default() {
        let mut exec = MockExecutor::new();
        exec.push_failure(QueryError::Timeout("canceling statement".into()));
        exec.set_default_sessions(vec![SessionRow::idle(1, 0)]);

        let t = Duration::from_millis(100);
        assert!(exec.query_sessions(t).is_err());
        assert_eq!(exec.query_sessions(t).unwrap().len(), 1);
        assert_eq!(exec.session_calls(), 2);
        assert_eq!(exec.last_timeout(), Some(t));
    }

    #[test]
    fn clones_share_counters() {
        let mut exec = MockExecutor::new();
        exec.set_explain("[]");
        let observer = exec.clone();
        exec.explain_query("SELECT 1", Duration::from_secs(1)).unwrap();
        assert_eq!(observer.explain_calls(), 1);
    }
}
