//! Raw session rows and their conversion into [`SessionSample`]s.

use chrono::{DateTime, Utc};

use crate::model::{SessionSample, SessionState};

/// Why a row could not become a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum RowError {
    MissingPid,
    MissingBackendStart,
    InvalidTimestamp(&'static str, i64),
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowError::MissingPid => write!(f, "row has no pid"),
            RowError::MissingBackendStart => write!(f, "row has no backend_start"),
            RowError::InvalidTimestamp(col, v) => write!(f, "invalid timestamp in {}: {}", col, v),
        }
    }
}

impl std::error::Error for RowError {}

/// One row of the session query with nullable columns as returned by the server.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionRow {
    pub pid: Option<i32>,
    pub database_name: Option<String>,
    pub username: Option<String>,
    pub application_name: Option<String>,
    pub client_address: Option<String>,
    pub state: Option<String>,
    pub backend_type: Option<String>,
    pub backend_start_ms: Option<i64>,
    pub xact_start_ms: Option<i64>,
    pub query_start_ms: Option<i64>,
    pub state_change_ms: Option<i64>,
    /// Server clock when the row was produced.
    pub sampled_at_ms: Option<i64>,
    pub wait_event_type: Option<String>,
    pub wait_event: Option<String>,
    pub query: Option<String>,
    pub query_id: Option<i64>,
    pub blocking_pid: Option<i32>,
    pub blocking_backend_start_ms: Option<i64>,
    pub blocking_query: Option<String>,
}

fn ts(col: &'static str, ms: i64) -> Result<DateTime<Utc>, RowError> {
    DateTime::from_timestamp_millis(ms).ok_or(RowError::InvalidTimestamp(col, ms))
}

fn opt_ts(col: &'static str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, RowError> {
    ms.map(|v| ts(col, v)).transpose()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

/// Truncates to at most `max_len` bytes on a char boundary.
pub(crate) fn truncate_text(mut text: String, max_len: usize) -> String {
    if text.len() > max_len {
        let mut cut = max_len;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

impl SessionRow {
    /// Converts the row into a sample.
    ///
    /// `fallback` stamps rows that carry no server clock.
    pub fn into_sample(
        self,
        fallback: DateTime<Utc>,
        max_query_len: usize,
    ) -> Result<SessionSample, RowError> {
        let pid = self.pid.ok_or(RowError::MissingPid)?;
        let backend_start_ms = self.backend_start_ms.ok_or(RowError::MissingBackendStart)?;
        let timestamp = opt_ts("sampled_at", self.sampled_at_ms)?.unwrap_or(fallback);
        let backend_start = ts("backend_start", backend_start_ms)?;

        let blocking_session_id = match (self.blocking_pid, self.blocking_backend_start_ms) {
            (Some(bpid), Some(bstart)) => Some(format!("{}-{}", bpid, bstart)),
            (Some(bpid), None) => Some(format!("{}-0", bpid)),
            _ => None,
        };

        Ok(SessionSample {
            session_id: format!("{}-{}", pid, backend_start_ms),
            timestamp,
            pid,
            database_name: self.database_name.unwrap_or_default(),
            username: self.username.unwrap_or_default(),
            application_name: self.application_name.unwrap_or_default(),
            client_address: self.client_address.unwrap_or_default(),
            backend_start,
            transaction_start: opt_ts("xact_start", self.xact_start_ms)?,
            query_start: opt_ts("query_start", self.query_start_ms)?,
            state_change: opt_ts("state_change", self.state_change_ms)?.unwrap_or(backend_start),
            state: SessionState::parse(self.state.as_deref().unwrap_or_default()),
            backend_type: self.backend_type.unwrap_or_default(),
            wait_event_type: non_empty(self.wait_event_type),
            wait_event: non_empty(self.wait_event),
            query_text: non_empty(self.query).map(|q| truncate_text(q, max_query_len)),
            query_id: self.query_id.filter(|id| *id != 0),
            blocking_session_id,
            blocking_query_text: non_empty(self.blocking_query)
                .map(|q| truncate_text(q, max_query_len)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn fallback() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(T0 + 99_000).unwrap()
    }

    #[test]
    fn builds_session_id_from_pid_and_backend_start() {
        let row = SessionRow::active(4242, "SELECT 1", T0);
        let sample = row.into_sample(fallback(), 4096).unwrap();
        assert_eq!(sample.session_id, format!("4242-{}", T0 - 60_000));
        assert_eq!(sample.state, SessionState::Active);
        assert_eq!(sample.timestamp.timestamp_millis(), T0);
    }

    #[test]
    fn missing_pid_is_rejected() {
        let row = SessionRow {
            backend_start_ms: Some(T0),
            ..Default::default()
        };
        assert_eq!(row.into_sample(fallback(), 10), Err(RowError::MissingPid));
    }

    #[test]
    fn uses_fallback_when_server_clock_absent() {
        let mut row = SessionRow::active(1, "SELECT 1", T0);
        row.sampled_at_ms = None;
        let sample = row.into_sample(fallback(), 4096).unwrap();
        assert_eq!(sample.timestamp, fallback());
    }

    #[test]
    fn empty_strings_become_none_and_zero_query_id_is_dropped() {
        let mut row = SessionRow::active(1, "", T0);
        row.wait_event = Some(String::new());
        row.query_id = Some(0);
        let sample = row.into_sample(fallback(), 4096).unwrap();
        assert_eq!(sample.query_text, None);
        assert_eq!(sample.wait_event, None);
        assert_eq!(sample.query_id, None);
    }

    #[test]
    fn blocking_columns_produce_blocking_session_id() {
        let row = SessionRow::active(1, "UPDATE t SET x = 1", T0)
            .blocked_by(7, T0 - 5_000, "UPDATE t SET x = 2");
        let sample = row.into_sample(fallback(), 4096).unwrap();
        assert_eq!(
            sample.blocking_session_id.as_deref(),
            Some(format!("7-{}", T0 - 5_000).as_str())
        );
        assert!(sample.is_blocked());
    }

    #[test]
    fn query_text_is_truncated_on_char_boundary() {
        let row = SessionRow::active(1, "SELECT 'ééé'", T0);
        let sample = row.into_sample(fallback(), 10).unwrap();
        let text = sample.query_text.unwrap();
        assert!(text.len() <= 10);
        assert!(text.starts_with("SELECT '"));
    }
}
