//! Query-execution capability consumed by the pipeline.
//!
//! The pipeline never talks to a driver directly. It depends on
//! [`QueryExecutor`], chosen at construction time:
//!
//! ```text
//!              ┌─────────────────────┐
//!              │    QueryExecutor    │ (trait)
//!              └──────────┬──────────┘
//!           ┌─────────────┴─────────────┐
//!    ┌──────▼───────────┐       ┌───────▼──────┐
//!    │ PostgresExecutor │       │ MockExecutor │
//!    │ (postgres crate) │       │ (tests)      │
//!    └──────────────────┘       └──────────────┘
//! ```
//!
//! ## Testing
//!
//! ```
//! use std::time::Duration;
//! use pgash_core::source::{MockExecutor, QueryExecutor, SessionRow};
//!
//! let mut exec = MockExecutor::new();
//! exec.push_sessions(vec![SessionRow::active(42, "SELECT 1", 1_700_000_000_000)]);
//! let rows = exec.query_sessions(Duration::from_millis(500)).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

pub mod mock;
mod postgres;
mod queries;
mod row;

use std::time::Duration;

pub use mock::MockExecutor;
pub use postgres::PostgresExecutor;
pub use row::{RowError, SessionRow};

/// Error returned by a [`QueryExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Could not establish or lost the connection.
    Connection(String),
    /// Statement was cancelled by the statement timeout.
    Timeout(String),
    /// Server rejected the statement.
    Query(String),
    /// A result row could not be decoded.
    Row(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Connection(msg) => write!(f, "connection: {}", msg),
            QueryError::Timeout(msg) => write!(f, "timeout: {}", msg),
            QueryError::Query(msg) => write!(f, "query error: {}", msg),
            QueryError::Row(msg) => write!(f, "row decode error: {}", msg),
        }
    }
}

impl std::error::Error for QueryError {}

/// Read-mostly access to a monitored database.
///
/// Every call carries its own timeout; implementations must not block longer
/// than that on the server side.
pub trait QueryExecutor: Send {
    /// Runs a statement and returns the number of affected rows.
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<u64, QueryError>;

    /// Runs a query and returns the first row as text columns, if any.
    fn query_row(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<Option<String>>>, QueryError>;

    /// Reads one row per backend from the session activity view.
    fn query_sessions(&mut self, timeout: Duration) -> Result<Vec<SessionRow>, QueryError>;

    /// Returns `EXPLAIN (FORMAT JSON)` output for `query` without executing it.
    fn explain_query(&mut self, query: &str, timeout: Duration) -> Result<String, QueryError>;

    /// Longest query text the server reports in the activity view, when known.
    ///
    /// Text of this length or longer has been cut by the server.
    fn query_text_limit(&self) -> Option<usize> {
        None
    }
}
