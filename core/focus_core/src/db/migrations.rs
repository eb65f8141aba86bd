use rusqlite::{Connection, OptionalExtension, Transaction};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// Applied in order, each exactly once. Append only; never edit a shipped entry.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
CREATE TABLE sessions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  status TEXT NOT NULL,
  start_ts TEXT NOT NULL,
  end_ts TEXT NOT NULL,
  duration INTEGER NOT NULL CHECK (duration >= 0),
  window_title TEXT NOT NULL DEFAULT '',
  process_name TEXT NOT NULL DEFAULT '',
  summary TEXT
);
CREATE INDEX idx_sessions_start_ts ON sessions(start_ts);

CREATE TABLE daily_aggregates (
  date TEXT PRIMARY KEY,
  total_focus_time INTEGER NOT NULL DEFAULT 0,
  total_entertainment_time INTEGER NOT NULL DEFAULT 0,
  max_focus_streak INTEGER NOT NULL DEFAULT 0,
  current_focus_streak INTEGER NOT NULL DEFAULT 0,
  efficiency_score INTEGER NOT NULL DEFAULT 0,
  willpower_wins INTEGER NOT NULL DEFAULT 0,
  summary_text TEXT NOT NULL DEFAULT ''
);

CREATE TABLE period_stats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  total_focus INTEGER NOT NULL,
  total_entertainment INTEGER NOT NULL,
  max_streak INTEGER NOT NULL,
  willpower_wins INTEGER NOT NULL,
  peak_hour INTEGER NOT NULL,
  efficiency_score INTEGER NOT NULL,
  daily_summary TEXT NOT NULL,
  focus_fragmentation_ratio REAL NOT NULL,
  context_switch_freq REAL NOT NULL,
  ai_insight TEXT NOT NULL
);
CREATE INDEX idx_period_stats_date ON period_stats(date);

CREATE TABLE core_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  category TEXT NOT NULL,
  rank INTEGER NOT NULL,
  app_name TEXT NOT NULL,
  clean_title TEXT NOT NULL,
  total_duration INTEGER NOT NULL,
  event_count INTEGER NOT NULL,
  UNIQUE(date, category, rank)
);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE app_settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  max_gap_seconds INTEGER NOT NULL,
  display_gap_seconds INTEGER NOT NULL,
  tz_offset_minutes INTEGER NOT NULL DEFAULT 0,
  top_k INTEGER NOT NULL,
  discrepancy_tolerance_seconds INTEGER NOT NULL,
  focus_total_source TEXT NOT NULL DEFAULT 'daily_aggregate',
  updated_at TEXT NOT NULL
);
"#,
    ),
    (
        3,
        r#"
CREATE TABLE period_stats_by_date (
  date TEXT PRIMARY KEY,
  total_focus INTEGER NOT NULL,
  total_entertainment INTEGER NOT NULL,
  max_streak INTEGER NOT NULL,
  willpower_wins INTEGER NOT NULL,
  peak_hour INTEGER NOT NULL,
  efficiency_score INTEGER NOT NULL,
  daily_summary TEXT NOT NULL,
  focus_fragmentation_ratio REAL NOT NULL,
  context_switch_freq REAL NOT NULL,
  ai_insight TEXT NOT NULL
);
INSERT INTO period_stats_by_date
SELECT date, total_focus, total_entertainment, max_streak, willpower_wins, peak_hour,
       efficiency_score, daily_summary, focus_fragmentation_ratio, context_switch_freq, ai_insight
FROM period_stats p
WHERE p.id = (SELECT MAX(q.id) FROM period_stats q WHERE q.date = p.date);
DROP TABLE period_stats;
ALTER TABLE period_stats_by_date RENAME TO period_stats;
"#,
    ),
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
    )?;
    let v: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(v.unwrap_or(0))
}

/// Brings the schema to `latest_version()`. Returns the number of migrations applied.
pub fn run_migrations(conn: &mut Connection) -> CoreResult<usize> {
    let version = current_version(conn)?;
    let supported = latest_version();
    if version > supported {
        return Err(CoreError::SchemaTooNew {
            found: version,
            supported,
        });
    }
    if version == supported {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let mut applied = 0;
    for (v, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > version) {
        apply_migration(&tx, *v, sql)?;
        applied += 1;
    }
    tx.commit()?;
    info!("schema migrated from v{version} to v{supported}");
    Ok(applied)
}

fn apply_migration(tx: &Transaction<'_>, version: i64, sql: &str) -> rusqlite::Result<()> {
    tx.execute_batch(sql)?;
    let applied_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    tx.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        (version, applied_at),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);

        let applied = run_migrations(&mut conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        assert_eq!(run_migrations(&mut conn).unwrap(), 0);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, MIGRATIONS.len() as i64);
    }

    #[test]
    fn migration_versions_are_linear() {
        for (i, (v, _)) in MIGRATIONS.iter().enumerate() {
            assert_eq!(*v, i as i64 + 1);
        }
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, 'x')",
            [latest_version() + 1],
        )
        .unwrap();
        let err = run_migrations(&mut conn).unwrap_err();
        assert!(matches!(err, CoreError::SchemaTooNew { .. }));
    }

    #[test]
    fn period_stats_rebuild_keeps_latest_row_per_date() {
        let mut conn = Connection::open_in_memory().unwrap();
        current_version(&conn).unwrap();
        let tx = conn.transaction().unwrap();
        for (v, sql) in &MIGRATIONS[..2] {
            apply_migration(&tx, *v, sql).unwrap();
        }
        tx.commit().unwrap();

        let insert = "INSERT INTO period_stats (date, total_focus, total_entertainment, max_streak, willpower_wins, peak_hour, efficiency_score, daily_summary, focus_fragmentation_ratio, context_switch_freq, ai_insight) VALUES (?1, ?2, 0, 0, 0, 9, 60, '', 0.0, 0.0, '')";
        conn.execute(insert, ("2026-02-15", 100)).unwrap();
        conn.execute(insert, ("2026-02-15", 200)).unwrap();
        conn.execute(insert, ("2026-02-16", 300)).unwrap();

        assert_eq!(run_migrations(&mut conn).unwrap(), 1);

        let date = crate::model::parse_date("2026-02-15").unwrap();
        assert_eq!(crate::db::period::count_period_rows(&conn, date).unwrap(), 1);
        let p = crate::db::period::load_period_stats(&conn, date).unwrap().unwrap();
        assert_eq!(p.total_focus, 200);

        // The store itself now rejects a second row for a date.
        assert!(conn.execute(insert, ("2026-02-16", 400)).is_err());
    }
}
