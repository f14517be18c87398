//! Session observations collected from the database activity view.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Backend types that run maintenance work on their own.
const MAINTENANCE_BACKEND_TYPES: &[&str] = &["autovacuum worker", "autovacuum launcher"];

/// Statement prefixes (lower-case) treated as maintenance operations.
const MAINTENANCE_STATEMENTS: &[&str] = &[
    "vacuum",
    "analyze",
    "reindex",
    "cluster",
    "create index",
    "create unique index",
    "refresh materialized view",
    "autovacuum:",
];

/// Session state as reported by the activity view.
///
/// Source: `pg_stat_activity.state`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    #[default]
    Idle,
    IdleInTransaction,
    IdleInTransactionAborted,
    FastpathFunctionCall,
    Disabled,
    /// Any state string not known above (including empty for background workers).
    Other(String),
}

impl SessionState {
    /// Parses the textual state column.
    pub fn parse(state: &str) -> Self {
        match state {
            "active" => SessionState::Active,
            "idle" => SessionState::Idle,
            "idle in transaction" => SessionState::IdleInTransaction,
            "idle in transaction (aborted)" => SessionState::IdleInTransactionAborted,
            "fastpath function call" => SessionState::FastpathFunctionCall,
            "disabled" => SessionState::Disabled,
            other => SessionState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::IdleInTransaction => "idle in transaction",
            SessionState::IdleInTransactionAborted => "idle in transaction (aborted)",
            SessionState::FastpathFunctionCall => "fastpath function call",
            SessionState::Disabled => "disabled",
            SessionState::Other(s) => s,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of one database session at one instant.
///
/// Source: one row of `pg_stat_activity`, enriched with the first blocking
/// backend from `pg_blocking_pids()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSample {
    /// Stable identity of the backend: `"<pid>-<backend_start epoch ms>"`.
    pub session_id: String,

    /// Database clock at the moment the row was read.
    pub timestamp: DateTime<Utc>,

    /// Source: `pg_stat_activity.pid`
    pub pid: i32,

    /// Source: `pg_stat_activity.datname`
    pub database_name: String,

    /// Source: `pg_stat_activity.usename`
    pub username: String,

    /// Source: `pg_stat_activity.application_name`
    pub application_name: String,

    /// Source: `pg_stat_activity.client_addr` (empty for unix sockets)
    pub client_address: String,

    /// Source: `pg_stat_activity.backend_start`
    pub backend_start: DateTime<Utc>,

    /// Source: `pg_stat_activity.xact_start`
    pub transaction_start: Option<DateTime<Utc>>,

    /// Source: `pg_stat_activity.query_start`
    pub query_start: Option<DateTime<Utc>>,

    /// Source: `pg_stat_activity.state_change`
    pub state_change: DateTime<Utc>,

    pub state: SessionState,

    /// Source: `pg_stat_activity.backend_type` (client backend, autovacuum worker, ...)
    pub backend_type: String,

    /// Source: `pg_stat_activity.wait_event_type` (Lock, LWLock, IO, ...)
    pub wait_event_type: Option<String>,

    /// Source: `pg_stat_activity.wait_event`
    pub wait_event: Option<String>,

    /// Current or last query text, truncated to the configured length.
    pub query_text: Option<String>,

    /// Source: `pg_stat_activity.query_id` (PostgreSQL 14+)
    pub query_id: Option<i64>,

    /// Session id of the first backend blocking this one.
    pub blocking_session_id: Option<String>,

    /// Query text of the blocking backend.
    pub blocking_query_text: Option<String>,
}

impl SessionSample {
    /// Creates an idle sample with the given identity; remaining fields are empty.
    pub fn new(session_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            pid: 0,
            database_name: String::new(),
            username: String::new(),
            application_name: String::new(),
            client_address: String::new(),
            backend_start: timestamp,
            transaction_start: None,
            query_start: None,
            state_change: timestamp,
            state: SessionState::Idle,
            backend_type: String::from("client backend"),
            wait_event_type: None,
            wait_event: None,
            query_text: None,
            query_id: None,
            blocking_session_id: None,
            blocking_query_text: None,
        }
    }

    /// True when another session blocks this one.
    pub fn is_blocked(&self) -> bool {
        self.blocking_session_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_event.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Elapsed time of the running query. Only defined while the session is active.
    pub fn query_duration(&self) -> Option<ChronoDuration> {
        if !self.is_active() {
            return None;
        }
        let start = self.query_start?;
        let elapsed = self.timestamp - start;
        (elapsed >= ChronoDuration::zero()).then_some(elapsed)
    }

    /// Query duration in milliseconds (0 when undefined).
    pub fn query_duration_ms(&self) -> u64 {
        self.query_duration()
            .map(|d| d.num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// True for autovacuum backends and VACUUM/ANALYZE/REINDEX-like statements.
    pub fn is_maintenance(&self) -> bool {
        if MAINTENANCE_BACKEND_TYPES.contains(&self.backend_type.as_str()) {
            return true;
        }
        let Some(query) = self.query_text.as_deref() else {
            return false;
        };
        let head: String = query
            .trim_start()
            .chars()
            .take(32)
            .collect::<String>()
            .to_lowercase();
        MAINTENANCE_STATEMENTS.iter().any(|p| head.starts_with(p))
    }
}

/// All samples produced by one collection tick.
#[derive(Clone, Debug, Default)]
pub struct SampleBatch {
    /// Monotonic tick number (1-based) of the producing sampler.
    pub tick: u64,
    /// Local wall clock when the tick finished.
    pub collected_at: Option<DateTime<Utc>>,
    pub samples: Vec<SessionSample>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples in `active` state.
    pub fn active_sessions(&self) -> usize {
        self.samples.iter().filter(|s| s.is_active()).count()
    }
}
