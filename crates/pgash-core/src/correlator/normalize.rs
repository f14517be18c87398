//! Normalization of SQL text into grouping patterns.
//!
//! Replaces literals (strings, dollar-quoted bodies, numbers, `$n`
//! parameters) with `?`, strips comments, collapses whitespace and lowers
//! everything outside double-quoted identifiers, so that
//! `SELECT * FROM t WHERE id = 1` and `select *  from t where id=42` both
//! become `select * from t where id = ?`.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Why a query could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    Empty,
    UnterminatedLiteral,
    UnterminatedComment,
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::Empty => write!(f, "empty query text"),
            NormalizeError::UnterminatedLiteral => write!(f, "unterminated literal"),
            NormalizeError::UnterminatedComment => write!(f, "unterminated comment"),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Operators that get a space on both sides after normalization.
const SPACED_OPERATORS: &[char] = &['=', '<', '>', '+', '*', '/', '%', '|', '!'];

/// Normalize a SQL statement into a grouping pattern.
pub fn normalize_query(query: &str) -> Result<String, NormalizeError> {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut i = 0;
    // Pending whitespace is emitted lazily so runs collapse into one space.
    let mut pending_space = false;

    let push = |out: &mut String, pending: &mut bool, s: &str| {
        if *pending && !out.is_empty() {
            out.push(' ');
        }
        *pending = false;
        out.push_str(s);
    };

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        // -- line comment
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            pending_space = true;
            continue;
        }

        // /* block comment */
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(NormalizeError::UnterminatedComment);
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            pending_space = true;
            continue;
        }

        // 'string' with '' escapes, including E'' and B'' prefixes
        if c == '\'' {
            i = skip_single_quoted(&chars, i)?;
            push(&mut out, &mut pending_space, "?");
            continue;
        }

        // "identifier" kept verbatim
        if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(NormalizeError::UnterminatedLiteral);
            }
            i += 1;
            let ident: String = chars[start..i].iter().collect();
            push(&mut out, &mut pending_space, &ident);
            continue;
        }

        if c == '$' {
            // $1 parameter
            if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                push(&mut out, &mut pending_space, "?");
                continue;
            }
            // $tag$ body $tag$
            if let Some(end) = dollar_tag_end(&chars, i) {
                let tag: Vec<char> = chars[i..end].to_vec();
                i = end;
                loop {
                    if i + tag.len() > chars.len() {
                        return Err(NormalizeError::UnterminatedLiteral);
                    }
                    if chars[i..i + tag.len()] == tag[..] {
                        i += tag.len();
                        break;
                    }
                    i += 1;
                }
                push(&mut out, &mut pending_space, "?");
                continue;
            }
        }

        // number not glued to an identifier
        let prev_is_word = out
            .chars()
            .last()
            .is_some_and(|p| !pending_space && (p.is_alphanumeric() || p == '_'));
        if (c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())))
            && !prev_is_word
        {
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || ((chars[i] == 'e' || chars[i] == 'E')
                        && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '-')))
            {
                if chars[i] == 'e' || chars[i] == 'E' {
                    i += 1;
                }
                i += 1;
            }
            push(&mut out, &mut pending_space, "?");
            continue;
        }

        // E'..' / B'..' / X'..' prefixed strings
        if matches!(c, 'e' | 'E' | 'b' | 'B' | 'x' | 'X')
            && chars.get(i + 1) == Some(&'\'')
            && !prev_is_word
        {
            i = skip_single_quoted(&chars, i + 1)?;
            push(&mut out, &mut pending_space, "?");
            continue;
        }

        if c == ',' {
            pending_space = false;
            out.push(',');
            pending_space = true;
            i += 1;
            continue;
        }

        if SPACED_OPERATORS.contains(&c) {
            let start = i;
            while i < chars.len() && (SPACED_OPERATORS.contains(&chars[i]) || chars[i] == '-') {
                i += 1;
            }
            let op: String = chars[start..i].iter().collect();
            pending_space = true;
            push(&mut out, &mut pending_space, &op);
            pending_space = true;
            continue;
        }

        let lower: String = c.to_lowercase().collect();
        push(&mut out, &mut pending_space, &lower);
        i += 1;
    }

    let trimmed = out.trim_end_matches(';').trim_end().to_string();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    Ok(trimmed)
}

/// Returns the index after the closing quote of a string starting at `start`.
fn skip_single_quoted(chars: &[char], start: usize) -> Result<usize, NormalizeError> {
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None => return Err(NormalizeError::UnterminatedLiteral),
            Some('\\') => i += 2,
            Some('\'') if chars.get(i + 1) == Some(&'\'') => i += 2,
            Some('\'') => return Ok(i + 1),
            Some(_) => i += 1,
        }
    }
}

/// If a dollar-quote tag (`$$` or `$name$`) starts at `start`, returns its end.
fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '$' {
            return Some(i + 1);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        i += 1;
    }
    None
}

/// Stable hex fingerprint of a normalized pattern.
pub fn fingerprint(normalized: &str) -> String {
    format!("{:016x}", xxh3_64(normalized.as_bytes()))
}

/// Statement kind of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Maintenance,
    Transaction,
    Utility,
    Other,
}

impl QueryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryCategory::Select => "select",
            QueryCategory::Insert => "insert",
            QueryCategory::Update => "update",
            QueryCategory::Delete => "delete",
            QueryCategory::Ddl => "ddl",
            QueryCategory::Maintenance => "maintenance",
            QueryCategory::Transaction => "transaction",
            QueryCategory::Utility => "utility",
            QueryCategory::Other => "other",
        }
    }
}

fn starts_with_word(pattern: &str, word: &str) -> bool {
    pattern.strip_prefix(word).is_some_and(|rest| {
        rest.is_empty() || rest.starts_with(|c: char| !c.is_alphanumeric() && c != '_')
    })
}

/// Classify a **normalized** pattern into a [`QueryCategory`].
///
/// Order of checks matters: first match wins.
pub fn classify_query(pattern: &str) -> QueryCategory {
    // --- Maintenance (before DDL: CREATE INDEX is maintenance) ---
    for prefix in [
        "vacuum",
        "analyze",
        "analyse",
        "reindex",
        "cluster",
        "autovacuum:",
        "refresh materialized view",
        "create index",
        "create unique index",
    ] {
        if pattern.starts_with(prefix) {
            return QueryCategory::Maintenance;
        }
    }

    // --- Data-modifying CTEs ---
    if starts_with_word(pattern, "with") {
        if let Some(pos) = pattern.rfind(") ") {
            let main = &pattern[pos + 2..];
            if main.starts_with("insert") {
                return QueryCategory::Insert;
            }
            if main.starts_with("update") {
                return QueryCategory::Update;
            }
            if main.starts_with("delete") {
                return QueryCategory::Delete;
            }
        }
        return QueryCategory::Select;
    }

    // --- DML ---
    if starts_with_word(pattern, "select")
        || starts_with_word(pattern, "values")
        || starts_with_word(pattern, "table")
        || pattern.starts_with("(select")
    {
        return QueryCategory::Select;
    }
    if starts_with_word(pattern, "insert") {
        return QueryCategory::Insert;
    }
    if starts_with_word(pattern, "update") {
        return QueryCategory::Update;
    }
    if starts_with_word(pattern, "delete") || starts_with_word(pattern, "merge") {
        return QueryCategory::Delete;
    }

    // --- DDL ---
    for word in ["create", "alter", "drop", "truncate", "comment", "grant", "revoke"] {
        if starts_with_word(pattern, word) {
            return QueryCategory::Ddl;
        }
    }

    // --- Transaction control ---
    for word in [
        "begin",
        "start transaction",
        "commit",
        "rollback",
        "savepoint",
        "release",
        "end",
        "abort",
        "prepare transaction",
    ] {
        if starts_with_word(pattern, word) {
            return QueryCategory::Transaction;
        }
    }

    // --- Utility ---
    for word in [
        "set", "show", "reset", "copy", "lock", "listen", "notify", "unlisten", "discard",
        "fetch", "declare", "close", "deallocate", "prepare", "execute", "explain", "checkpoint",
        "load", "do", "call", "move",
    ] {
        if starts_with_word(pattern, word) {
            return QueryCategory::Utility;
        }
    }

    QueryCategory::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_numbers_and_strings() {
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE id = 42 AND name = 'bob'").unwrap(),
            "select * from users where id = ? and name = ?"
        );
    }

    #[test]
    fn test_normalize_groups_variants() {
        let a = normalize_query("SELECT * FROM t WHERE id = 1").unwrap();
        let b = normalize_query("select *  from t\n  where id=42;").unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_normalize_keeps_digits_in_identifiers() {
        assert_eq!(
            normalize_query("SELECT col1 FROM t2 WHERE x = 3").unwrap(),
            "select col1 from t2 where x = ?"
        );
    }

    #[test]
    fn test_normalize_params_and_dollar_quotes() {
        assert_eq!(
            normalize_query("UPDATE t SET v = $1 WHERE id = $2").unwrap(),
            "update t set v = ? where id = ?"
        );
        assert_eq!(
            normalize_query("DO $body$ BEGIN PERFORM 1; END $body$").unwrap(),
            "do ?"
        );
    }

    #[test]
    fn test_normalize_escaped_quotes_and_prefixes() {
        assert_eq!(
            normalize_query("SELECT 'it''s', E'a\\'b' FROM t").unwrap(),
            "select ?, ? from t"
        );
    }

    #[test]
    fn test_normalize_strips_comments() {
        assert_eq!(
            normalize_query("/* app:web */ SELECT 1 -- trailing\n").unwrap(),
            "select ?"
        );
    }

    #[test]
    fn test_normalize_preserves_quoted_identifiers() {
        assert_eq!(
            normalize_query(r#"SELECT "UserId" FROM "Orders""#).unwrap(),
            r#"select "UserId" from "Orders""#
        );
    }

    #[test]
    fn test_normalize_errors() {
        assert_eq!(normalize_query("   "), Err(NormalizeError::Empty));
        assert_eq!(
            normalize_query("SELECT 'oops"),
            Err(NormalizeError::UnterminatedLiteral)
        );
        assert_eq!(
            normalize_query("SELECT 1 /* open"),
            Err(NormalizeError::UnterminatedComment)
        );
    }

    #[test]
    fn test_normalize_negative_and_float() {
        assert_eq!(
            normalize_query("SELECT 1.5e3, .25 FROM t WHERE a >= 10").unwrap(),
            "select ?, ? from t where a >= ?"
        );
    }

    #[test]
    fn test_classify_dml() {
        assert_eq!(classify_query("select ?"), QueryCategory::Select);
        assert_eq!(classify_query("insert into t values (?)"), QueryCategory::Insert);
        assert_eq!(classify_query("update t set a = ?"), QueryCategory::Update);
        assert_eq!(classify_query("delete from t"), QueryCategory::Delete);
        assert_eq!(
            classify_query("with x as (select ?) delete from t"),
            QueryCategory::Delete
        );
        assert_eq!(
            classify_query("with x as (select ?) select * from x"),
            QueryCategory::Select
        );
    }

    #[test]
    fn test_classify_maintenance_before_ddl() {
        assert_eq!(
            classify_query("create index i on t (a)"),
            QueryCategory::Maintenance
        );
        assert_eq!(classify_query("create table t (a int)"), QueryCategory::Ddl);
        assert_eq!(
            classify_query("autovacuum: vacuum public.orders"),
            QueryCategory::Maintenance
        );
    }

    #[test]
    fn test_classify_transaction_and_utility() {
        assert_eq!(classify_query("begin"), QueryCategory::Transaction);
        assert_eq!(classify_query("commit"), QueryCategory::Transaction);
        assert_eq!(classify_query("set statement_timeout = ?"), QueryCategory::Utility);
        assert_eq!(classify_query("explain select ?"), QueryCategory::Utility);
        assert_eq!(classify_query("selector"), QueryCategory::Other);
    }
}
