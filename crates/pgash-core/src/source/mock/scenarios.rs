//! Pre-built session rows for testing.
//!
//! These produce realistic `pg_stat_activity` shapes: busy OLTP traffic,
//! lock chains and background maintenance.

use crate::source::SessionRow;

/// EXPLAIN output for a join over two tables with an index scan.
pub const SIMPLE_PLAN_JSON: &str = r#"[
  {
    "Plan": {
      "Node Type": "Hash Join",
      "Join Type": "Inner",
      "Startup Cost": 12.5,
      "Total Cost": 245.75,
      "Plan Rows": 120,
      "Plan Width": 64,
      "Plans": [
        {
          "Node Type": "Seq Scan",
          "Relation Name": "orders",
          "Startup Cost": 0.0,
          "Total Cost": 180.0,
          "Plan Rows": 4000,
          "Plan Width": 32
        },
        {
          "Node Type": "Hash",
          "Startup Cost": 8.3,
          "Total Cost": 8.3,
          "Plan Rows": 12,
          "Plan Width": 32,
          "Plans": [
            {
              "Node Type": "Index Scan",
              "Relation Name": "customers",
              "Index Name": "customers_pkey",
              "Startup Cost": 0.29,
              "Total Cost": 8.3,
              "Plan Rows": 12,
              "Plan Width": 32
            }
          ]
        }
      ]
    }
  }
]"#;

impl SessionRow {
    /// Client backend running `query`, connected a minute before `now_ms`.
    pub fn active(pid: i32, query: &str, now_ms: i64) -> Self {
        Self {
            pid: Some(pid),
            database_name: Some("app".to_string()),
            username: Some("app_user".to_string()),
            application_name: Some("web".to_string()),
            client_address: Some(format!("10.0.0.{}", pid % 250 + 1)),
            state: Some("active".to_string()),
            backend_type: Some("client backend".to_string()),
            backend_start_ms: Some(now_ms - 60_000),
            xact_start_ms: Some(now_ms - 10),
            query_start_ms: Some(now_ms - 10),
            state_change_ms: Some(now_ms - 10),
            sampled_at_ms: Some(now_ms),
            query: Some(query.to_string()),
            ..Default::default()
        }
    }

    /// Idle client backend.
    pub fn idle(pid: i32, now_ms: i64) -> Self {
        Self {
            state: Some("idle".to_string()),
            xact_start_ms: None,
            query_start_ms: Some(now_ms - 30_000),
            state_change_ms: Some(now_ms - 29_000),
            ..Self::active(pid, "COMMIT", now_ms)
        }
    }

    /// Moves `query_start` so the statement has been running for `ms`.
    pub fn running_for(mut self, ms: i64) -> Self {
        if let Some(now) = self.sampled_at_ms {
            self.query_start_ms = Some(now - ms);
            self.xact_start_ms = Some(now - ms);
        }
        self
    }

    /// Marks the backend as waiting on a lock held by `pid`.
    pub fn blocked_by(mut self, pid: i32, backend_start_ms: i64, query: &str) -> Self {
        self.wait_event_type = Some("Lock".to_string());
        self.wait_event = Some("transactionid".to_string());
        self.blocking_pid = Some(pid);
        self.blocking_backend_start_ms = Some(backend_start_ms);
        self.blocking_query = Some(query.to_string());
        self
    }

    pub fn with_query_id(mut self, query_id: i64) -> Self {
        self.query_id = Some(query_id);
        self
    }

    pub fn waiting(mut self, event_type: &str, event: &str) -> Self {
        self.wait_event_type = Some(event_type.to_string());
        self.wait_event = Some(event.to_string());
        self
    }

    pub fn in_database(mut self, database: &str) -> Self {
        self.database_name = Some(database.to_string());
        self
    }

    /// Autovacuum worker processing `table`.
    pub fn autovacuum(pid: i32, table: &str, now_ms: i64) -> Self {
        Self {
            username: None,
            application_name: None,
            client_address: None,
            backend_type: Some("autovacuum worker".to_string()),
            ..Self::active(pid, &format!("autovacuum: VACUUM public.{}", table), now_ms)
        }
    }
}

/// `n` short active queries spread over a handful of statement shapes.
pub fn busy_system(n: usize, now_ms: i64) -> Vec<SessionRow> {
    const SHAPES: [&str; 4] = [
        "SELECT * FROM orders WHERE id = 1",
        "SELECT name FROM customers WHERE id = 2",
        "UPDATE carts SET total = 10 WHERE id = 3",
        "INSERT INTO events (kind) VALUES ('click')",
    ];
    (0..n)
        .map(|i| {
            let query = SHAPES[i % SHAPES.len()];
            SessionRow::active(1000 + i as i32, query, now_ms).with_query_id(100 + (i % 4) as i64)
        })
        .collect()
}

/// One long transaction holding a lock and two sessions waiting on it.
pub fn blocking_chain(now_ms: i64) -> Vec<SessionRow> {
    let holder = SessionRow::active(500, "UPDATE accounts SET balance = 0 WHERE id = 1", now_ms)
        .running_for(45_000)
        .with_query_id(900);
    let holder_start = holder.backend_start_ms.unwrap_or_default();
    let holder_query = holder.query.clone().unwrap_or_default();

    let waiters = [501, 502].into_iter().map(|pid| {
        SessionRow::active(pid, "UPDATE accounts SET balance = balance + 5 WHERE id = 1", now_ms)
            .running_for(3_000)
            .with_query_id(901)
            .blocked_by(500, holder_start, &holder_query)
    });

    std::iter::once(holder).chain(waiters).collect()
}

/// Busy traffic plus idle connections, a lock chain and an autovacuum worker.
pub fn mixed_workload(now_ms: i64) -> Vec<SessionRow> {
    let mut rows = busy_system(6, now_ms);
    rows.extend(blocking_chain(now_ms));
    rows.push(SessionRow::idle(700, now_ms));
    rows.push(SessionRow::idle(701, now_ms));
    rows.push(
        SessionRow::active(702, "SELECT pg_sleep(1)", now_ms).waiting("Timeout", "PgSleep"),
    );
    rows.push(SessionRow::autovacuum(800, "orders", now_ms));
    rows
}
