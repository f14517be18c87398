//! SQL builders for the session activity view.

/// Builds the version-aware session query.
///
/// One row per backend except the sampler's own. Timestamps are returned as
/// epoch milliseconds; the first blocking pid (if any) is resolved through a
/// lateral self-join so the blocker's query text comes back in the same row.
pub(super) fn build_session_query(server_version_num: Option<i32>, max_query_len: usize) -> String {
    let query_id_expr = if server_version_num.unwrap_or(0) >= 140000 {
        "a.query_id"
    } else {
        "NULL::bigint"
    };
    let max_len = max_query_len.max(1);

    format!(
        r#"
            SELECT
                a.pid,
                a.datname,
                a.usename,
                a.application_name,
                a.client_addr::text as client_addr,
                a.state,
                a.backend_type,
                (EXTRACT(EPOCH FROM a.backend_start) * 1000)::bigint as backend_start_ms,
                (EXTRACT(EPOCH FROM a.xact_start) * 1000)::bigint as xact_start_ms,
                (EXTRACT(EPOCH FROM a.query_start) * 1000)::bigint as query_start_ms,
                (EXTRACT(EPOCH FROM a.state_change) * 1000)::bigint as state_change_ms,
                (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::bigint as sampled_at_ms,
                a.wait_event_type,
                a.wait_event,
                LEFT(a.query, {max_len}) as query,
                {query_id_expr} as query_id,
                b.pid as blocking_pid,
                (EXTRACT(EPOCH FROM b.backend_start) * 1000)::bigint as blocking_backend_start_ms,
                LEFT(b.query, {max_len}) as blocking_query
            FROM pg_stat_activity a
            LEFT JOIN LATERAL (
                SELECT bp.pid, bp.backend_start, bp.query
                FROM pg_stat_activity bp
                WHERE bp.pid = (pg_blocking_pids(a.pid))[1]
            ) b ON true
            WHERE a.pid <> pg_backend_pid()
        "#
    )
}

/// Wraps a statement for plan extraction without running it.
pub(super) fn build_explain_query(query: &str) -> String {
    format!("EXPLAIN (FORMAT JSON) {}", query)
}

/// Session-level statement timeout in milliseconds.
pub(super) fn build_statement_timeout(timeout_ms: u64) -> String {
    format!("SET statement_timeout = {}", timeout_ms.max(1))
}
