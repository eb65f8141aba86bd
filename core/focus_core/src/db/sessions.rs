use std::collections::BTreeSet;

use rusqlite::{params_from_iter, types::Value, Connection, Row};
use serde::Deserialize;
use time::{Date, OffsetDateTime, UtcOffset};

use super::conversion_error;
use crate::model::{day_window, fmt_ts, local_date, parse_ts, Session, Status};

/// Which sessions a bulk status rewrite applies to. Empty fields match everything.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionFilter {
    /// Case-insensitive substring of the process name.
    #[serde(default)]
    pub process_contains: Option<String>,
    #[serde(default)]
    pub title_contains: Option<String>,
    /// Only rewrite sessions currently in one of these statuses.
    #[serde(default)]
    pub from_statuses: Vec<Status>,
}

pub fn insert_session(conn: &Connection, s: &Session) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO sessions (status, start_ts, end_ts, duration, window_title, process_name, summary) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            s.status.as_str(),
            fmt_ts(s.start),
            fmt_ts(s.end),
            s.duration,
            &s.window_title,
            &s.process_name,
            s.summary.as_deref(),
        ),
    )?;
    Ok(conn.last_insert_rowid())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(0)?;
    let status = Status::parse(&status).map_err(|_| conversion_error(0))?;
    let start: String = row.get(1)?;
    let start = parse_ts(&start).ok_or_else(|| conversion_error(1))?;
    let end: String = row.get(2)?;
    let end = parse_ts(&end).ok_or_else(|| conversion_error(2))?;
    Ok(Session {
        status,
        start,
        end,
        duration: row.get(3)?,
        window_title: row.get(4)?,
        process_name: row.get(5)?,
        summary: row.get(6)?,
    })
}

pub fn list_sessions_between(
    conn: &Connection,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> rusqlite::Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT status, start_ts, end_ts, duration, window_title, process_name, summary FROM sessions WHERE start_ts >= ?1 AND start_ts < ?2 ORDER BY start_ts ASC, id ASC",
    )?;
    let rows = stmt.query_map((fmt_ts(start), fmt_ts(end)), session_from_row)?;
    rows.collect()
}

/// Sessions whose start falls on `date` in the given offset.
pub fn list_sessions_for_date(
    conn: &Connection,
    date: Date,
    tz: UtcOffset,
) -> rusqlite::Result<Vec<Session>> {
    let (start, end) = day_window(date, tz);
    list_sessions_between(conn, start, end)
}

/// End of the latest stored session. Stored timestamps sort lexically.
pub fn latest_end(conn: &Connection) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = conn.query_row("SELECT MAX(end_ts) FROM sessions", [], |row| row.get(0))?;
    match raw {
        Some(ts) => parse_ts(&ts).map(Some).ok_or_else(|| conversion_error(0)),
        None => Ok(None),
    }
}

/// Distinct local dates that have at least one session.
pub fn session_dates(conn: &Connection, tz: UtcOffset) -> rusqlite::Result<BTreeSet<Date>> {
    let mut stmt = conn.prepare("SELECT DISTINCT start_ts FROM sessions")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = BTreeSet::new();
    for r in rows {
        let ts = r?;
        let t = parse_ts(&ts).ok_or_else(|| conversion_error(0))?;
        out.insert(local_date(t, tz));
    }
    Ok(out)
}

/// Rewrites `status` on every matching session in `[start, end)`.
/// Returns the start times of the rewritten sessions.
pub fn update_status_between(
    conn: &Connection,
    start: OffsetDateTime,
    end: OffsetDateTime,
    filter: &SessionFilter,
    new_status: Status,
) -> rusqlite::Result<Vec<OffsetDateTime>> {
    let mut clauses = vec!["start_ts >= ?".to_string(), "start_ts < ?".to_string()];
    let mut params: Vec<Value> = vec![Value::Text(fmt_ts(start)), Value::Text(fmt_ts(end))];

    if let Some(p) = filter.process_contains.as_deref().filter(|p| !p.is_empty()) {
        clauses.push("instr(lower(process_name), lower(?)) > 0".to_string());
        params.push(Value::Text(p.to_string()));
    }
    if let Some(t) = filter.title_contains.as_deref().filter(|t| !t.is_empty()) {
        clauses.push("instr(lower(window_title), lower(?)) > 0".to_string());
        params.push(Value::Text(t.to_string()));
    }
    if !filter.from_statuses.is_empty() {
        let marks = vec!["?"; filter.from_statuses.len()].join(", ");
        clauses.push(format!("status IN ({marks})"));
        for st in &filter.from_statuses {
            params.push(Value::Text(st.as_str().to_string()));
        }
    }
    clauses.push("status <> ?".to_string());
    params.push(Value::Text(new_status.as_str().to_string()));

    let where_sql = clauses.join(" AND ");
    let mut stmt = conn.prepare(&format!("SELECT id, start_ts FROM sessions WHERE {where_sql}"))?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut touched = Vec::new();
    let mut ids = Vec::new();
    for r in rows {
        let (id, ts) = r?;
        touched.push(parse_ts(&ts).ok_or_else(|| conversion_error(1))?);
        ids.push(id);
    }

    let mut update = conn.prepare("UPDATE sessions SET status = ?1 WHERE id = ?2")?;
    for id in ids {
        update.execute((new_status.as_str(), id))?;
    }
    Ok(touched)
}
