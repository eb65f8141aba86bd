use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row};
use time::Date;

use super::conversion_error;
use crate::model::{parse_date, DailyAggregate};

const COLUMNS: &str = "date, total_focus_time, total_entertainment_time, max_focus_streak, current_focus_streak, efficiency_score, willpower_wins, summary_text";

fn daily_from_row(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    let date: String = row.get(0)?;
    Ok(DailyAggregate {
        date: parse_date(&date).map_err(|_| conversion_error(0))?,
        total_focus_time: row.get(1)?,
        total_entertainment_time: row.get(2)?,
        max_focus_streak: row.get(3)?,
        current_focus_streak: row.get(4)?,
        efficiency_score: row.get(5)?,
        willpower_wins: row.get(6)?,
        summary_text: row.get(7)?,
    })
}

pub fn load_daily(conn: &Connection, date: Date) -> rusqlite::Result<Option<DailyAggregate>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM daily_aggregates WHERE date = ?1"),
        [date.to_string()],
        daily_from_row,
    )
    .optional()
}

pub fn upsert_daily(conn: &Connection, d: &DailyAggregate) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO daily_aggregates (date, total_focus_time, total_entertainment_time, max_focus_streak, current_focus_streak, efficiency_score, willpower_wins, summary_text)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(date) DO UPDATE SET
  total_focus_time=excluded.total_focus_time,
  total_entertainment_time=excluded.total_entertainment_time,
  max_focus_streak=excluded.max_focus_streak,
  current_focus_streak=excluded.current_focus_streak,
  efficiency_score=excluded.efficiency_score,
  willpower_wins=excluded.willpower_wins,
  summary_text=excluded.summary_text
        "#,
        (
            d.date.to_string(),
            d.total_focus_time,
            d.total_entertainment_time,
            d.max_focus_streak,
            d.current_focus_streak,
            d.efficiency_score,
            d.willpower_wins,
            &d.summary_text,
        ),
    )?;
    Ok(())
}

/// Overwrites the cached streak on an existing row only.
pub fn update_max_streak(conn: &Connection, date: Date, max_streak: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE daily_aggregates SET max_focus_streak = ?1, current_focus_streak = MIN(current_focus_streak, ?1) WHERE date = ?2",
        (max_streak, date.to_string()),
    )
}

pub fn daily_dates(conn: &Connection) -> rusqlite::Result<BTreeSet<Date>> {
    let mut stmt = conn.prepare("SELECT date FROM daily_aggregates")?;
    let rows = stmt.query_map([], |row| {
        let date: String = row.get(0)?;
        parse_date(&date).map_err(|_| conversion_error(0))
    })?;
    rows.collect()
}

pub fn list_daily_between(
    conn: &Connection,
    start: Date,
    end: Date,
) -> rusqlite::Result<Vec<DailyAggregate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM daily_aggregates WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC"
    ))?;
    let rows = stmt.query_map((start.to_string(), end.to_string()), daily_from_row)?;
    rows.collect()
}
