use rusqlite::{Connection, OptionalExtension, Row};
use time::Date;

use super::conversion_error;
use crate::model::{parse_date, PeriodStats};

const COLUMNS: &str = "date, total_focus, total_entertainment, max_streak, willpower_wins, peak_hour, efficiency_score, daily_summary, focus_fragmentation_ratio, context_switch_freq, ai_insight";

fn period_from_row(row: &Row<'_>) -> rusqlite::Result<PeriodStats> {
    let date: String = row.get(0)?;
    Ok(PeriodStats {
        date: parse_date(&date).map_err(|_| conversion_error(0))?,
        total_focus: row.get(1)?,
        total_entertainment: row.get(2)?,
        max_streak: row.get(3)?,
        willpower_wins: row.get(4)?,
        peak_hour: row.get(5)?,
        efficiency_score: row.get(6)?,
        daily_summary: row.get(7)?,
        focus_fragmentation_ratio: row.get(8)?,
        context_switch_freq: row.get(9)?,
        ai_insight: row.get(10)?,
    })
}

/// Delete-then-insert keyed by date. Callers wrap this in a transaction.
pub fn replace_period_stats(conn: &Connection, p: &PeriodStats) -> rusqlite::Result<()> {
    let date = p.date.to_string();
    conn.execute("DELETE FROM period_stats WHERE date = ?1", [&date])?;
    conn.execute(
        &format!(
            "INSERT INTO period_stats ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        rusqlite::params![
            date,
            p.total_focus,
            p.total_entertainment,
            p.max_streak,
            p.willpower_wins,
            p.peak_hour,
            p.efficiency_score,
            p.daily_summary,
            p.focus_fragmentation_ratio,
            p.context_switch_freq,
            p.ai_insight,
        ],
    )?;
    Ok(())
}

pub fn load_period_stats(conn: &Connection, date: Date) -> rusqlite::Result<Option<PeriodStats>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM period_stats WHERE date = ?1"),
        [date.to_string()],
        period_from_row,
    )
    .optional()
}

pub fn list_period_between(
    conn: &Connection,
    start: Date,
    end: Date,
) -> rusqlite::Result<Vec<PeriodStats>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM period_stats WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC"
    ))?;
    let rows = stmt.query_map((start.to_string(), end.to_string()), period_from_row)?;
    rows.collect()
}

pub fn count_period_rows(conn: &Connection, date: Date) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM period_stats WHERE date = ?1",
        [date.to_string()],
        |row| row.get(0),
    )
}
