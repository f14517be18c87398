//! PostgreSQL executor backed by the synchronous `postgres` client.
//!
//! Connects lazily and reconnects on the next call after a connection loss.
//! Statement timeouts are enforced server-side with `statement_timeout`, set
//! only when the requested value changes.

use std::time::Duration;

use postgres::error::SqlState;
use postgres::{Client, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, info, warn};

use super::queries::{build_explain_query, build_session_query, build_statement_timeout};
use super::row::SessionRow;
use super::{QueryError, QueryExecutor};

const DEFAULT_MAX_QUERY_TEXT_LEN: usize = 4096;

/// Session-sampling executor for PostgreSQL.
///
/// Connects using a libpq-style connection string
/// (`host=... port=... user=... dbname=...`).
pub struct PostgresExecutor {
    connection_string: String,
    client: Option<Client>,
    last_error: Option<String>,
    server_version_num: Option<i32>,
    /// `track_activity_query_size` read on connect, in bytes.
    activity_query_size: Option<usize>,
    /// `statement_timeout` currently set on the connection, in ms.
    applied_timeout_ms: Option<u64>,
    max_query_text_len: usize,
}

impl PostgresExecutor {
    /// Creates an executor with an explicit connection string.
    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            client: None,
            last_error: None,
            server_version_num: None,
            activity_query_size: None,
            applied_timeout_ms: None,
            max_query_text_len: DEFAULT_MAX_QUERY_TEXT_LEN,
        }
    }

    /// Limits query text fetched from the server.
    pub fn with_max_query_text_len(mut self, len: usize) -> Self {
        self.max_query_text_len = len;
        self
    }

    /// Connects eagerly so startup can report bad credentials.
    pub fn try_connect(&mut self) -> Result<(), QueryError> {
        self.ensure_connected()
    }

    /// Returns the last error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn server_version_num(&self) -> Option<i32> {
        self.server_version_num
    }

    /// Database named by the connection string; libpq falls back to the user name.
    pub fn database(&self) -> Option<String> {
        let config = self.connection_string.parse::<postgres::Config>().ok()?;
        config.get_dbname().or(config.get_user()).map(str::to_string)
    }

    fn ensure_connected(&mut self) -> Result<(), QueryError> {
        if self.client.is_some() {
            return Ok(());
        }

        match Client::connect(&self.connection_string, NoTls) {
            Ok(mut client) => {
                // Determine server version once per (re)connect.
                self.server_version_num = client
                    .query_one("SHOW server_version_num", &[])
                    .ok()
                    .and_then(|row| row.try_get::<_, String>(0).ok())
                    .and_then(|v| v.parse::<i32>().ok());
                self.activity_query_size = client
                    .query_one(
                        "SELECT setting FROM pg_settings WHERE name = 'track_activity_query_size'",
                        &[],
                    )
                    .ok()
                    .and_then(|row| row.try_get::<_, String>(0).ok())
                    .and_then(|v| v.parse::<usize>().ok());
                self.applied_timeout_ms = None;
                self.client = Some(client);
                self.last_error = None;
                info!(
                    server_version_num = ?self.server_version_num,
                    activity_query_size = ?self.activity_query_size,
                    "connected to PostgreSQL"
                );
                Ok(())
            }
            Err(e) => {
                let msg = format_postgres_error(&e);
                self.last_error = Some(msg.clone());
                self.server_version_num = None;
                Err(QueryError::Connection(msg))
            }
        }
    }

    /// Connects if needed and sets `statement_timeout` to `timeout`.
    fn prepare(&mut self, timeout: Duration) -> Result<&mut Client, QueryError> {
        self.ensure_connected()?;
        let timeout_ms = (timeout.as_millis() as u64).max(1);

        if self.applied_timeout_ms != Some(timeout_ms) {
            let result = match self.client.as_mut() {
                Some(client) => client.batch_execute(&build_statement_timeout(timeout_ms)),
                None => return Err(QueryError::Connection("not connected".to_string())),
            };
            if let Err(e) = result {
                return Err(self.fail(e));
            }
            debug!(timeout_ms, "statement_timeout applied");
            self.applied_timeout_ms = Some(timeout_ms);
        }

        self.client
            .as_mut()
            .ok_or_else(|| QueryError::Connection("not connected".to_string()))
    }

    /// Classifies a driver error, dropping the connection when it is unusable.
    fn fail(&mut self, e: postgres::Error) -> QueryError {
        let msg = format_postgres_error(&e);
        self.last_error = Some(msg.clone());

        if e.code() == Some(&SqlState::QUERY_CANCELED) {
            return QueryError::Timeout(msg);
        }
        if e.is_closed() || e.as_db_error().is_none() {
            warn!(error = %msg, "PostgreSQL connection lost");
            self.client = None;
            self.server_version_num = None;
            self.applied_timeout_ms = None;
            return QueryError::Connection(msg);
        }
        QueryError::Query(msg)
    }

    /// Runs `sql` through the simple protocol and returns the first row as text.
    fn first_text_row(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<Option<String>>>, QueryError> {
        let result = self.prepare(timeout)?.simple_query(sql);
        let messages = result.map_err(|e| self.fail(e))?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let values = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                return Ok(Some(values));
            }
        }
        Ok(None)
    }
}

impl QueryExecutor for PostgresExecutor {
    fn execute(&mut self, sql: &str, timeout: Duration) -> Result<u64, QueryError> {
        let result = self.prepare(timeout)?.execute(sql, &[]);
        result.map_err(|e| self.fail(e))
    }

    fn query_row(
        &mut self,
        sql: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<Option<String>>>, QueryError> {
        self.first_text_row(sql, timeout)
    }

    fn query_sessions(&mut self, timeout: Duration) -> Result<Vec<SessionRow>, QueryError> {
        self.ensure_connected()?;
        let sql = build_session_query(self.server_version_num, self.max_query_text_len);
        let result = self.prepare(timeout)?.query(&sql, &[]);
        let rows = result.map_err(|e| self.fail(e))?;
        rows.iter().map(session_row).collect()
    }

    fn explain_query(&mut self, query: &str, timeout: Duration) -> Result<String, QueryError> {
        // json columns do not decode into String over the extended protocol
        let row = self.first_text_row(&build_explain_query(query), timeout)?;
        row.and_then(|values| values.into_iter().next().flatten())
            .ok_or_else(|| QueryError::Row("EXPLAIN returned no rows".to_string()))
    }

    fn query_text_limit(&self) -> Option<usize> {
        self.activity_query_size.map(activity_text_limit)
    }
}

/// The activity view keeps at most `track_activity_query_size - 1` bytes.
fn activity_text_limit(track_activity_query_size: usize) -> usize {
    track_activity_query_size.saturating_sub(1).max(1)
}

fn session_row(row: &Row) -> Result<SessionRow, QueryError> {
    fn col<'a, T: postgres::types::FromSql<'a>>(
        row: &'a Row,
        name: &str,
    ) -> Result<Option<T>, QueryError> {
        row.try_get::<_, Option<T>>(name)
            .map_err(|e| QueryError::Row(format!("{}: {}", name, e)))
    }

    Ok(SessionRow {
        pid: col(row, "pid")?,
        database_name: col(row, "datname")?,
        username: col(row, "usename")?,
        application_name: col(row, "application_name")?,
        client_address: col(row, "client_addr")?,
        state: col(row, "state")?,
        backend_type: col(row, "backend_type")?,
        backend_start_ms: col(row, "backend_start_ms")?,
        xact_start_ms: col(row, "xact_start_ms")?,
        query_start_ms: col(row, "query_start_ms")?,
        state_change_ms: col(row, "state_change_ms")?,
        sampled_at_ms: col(row, "sampled_at_ms")?,
        wait_event_type: col(row, "wait_event_type")?,
        wait_event: col(row, "wait_event")?,
        query: col(row, "query")?,
        query_id: col(row, "query_id")?,
        blocking_pid: col(row, "blocking_pid")?,
        blocking_backend_start_ms: col(row, "blocking_backend_start_ms")?,
        blocking_query: col(row, "blocking_query")?,
    })
}

/// Formats a PostgreSQL error message for logs.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_server_reports_connection_error() {
        let mut exec = PostgresExecutor::with_connection_string(
            "host=127.0.0.1 port=1 user=nobody dbname=nothing connect_timeout=1".to_string(),
        );
        let err = exec.query_sessions(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, QueryError::Connection(_)));
        assert!(exec.last_error().is_some());
        assert_eq!(exec.server_version_num(), None);
    }

    #[test]
    fn database_comes_from_dbname_or_user() {
        let exec = PostgresExecutor::with_connection_string(
            "host=db user=monitor dbname=orders".to_string(),
        );
        assert_eq!(exec.database().as_deref(), Some("orders"));
        let exec = PostgresExecutor::with_connection_string("host=db user=monitor".to_string());
        assert_eq!(exec.database().as_deref(), Some("monitor"));
    }

    #[test]
    fn server_limit_is_one_below_activity_size() {
        assert_eq!(activity_text_limit(1024), 1023);
        let exec = PostgresExecutor::with_connection_string(String::new());
        assert_eq!(exec.query_text_limit(), None);
    }

    #[test]
    fn max_query_text_len_is_configurable() {
        let exec = PostgresExecutor::with_connection_string(String::new())
            .with_max_query_text_len(128);
        assert_eq!(exec.max_query_text_len, 128);
    }
}
