use rusqlite::{Connection, Row};
use time::Date;

use super::conversion_error;
use crate::model::{parse_date, Category, CoreEvent};

const COLUMNS: &str = "date, category, rank, app_name, clean_title, total_duration, event_count";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CoreEvent> {
    let date: String = row.get(0)?;
    let category: String = row.get(1)?;
    Ok(CoreEvent {
        date: parse_date(&date).map_err(|_| conversion_error(0))?,
        category: Category::parse(&category).ok_or_else(|| conversion_error(1))?,
        rank: row.get(2)?,
        app_name: row.get(3)?,
        clean_title: row.get(4)?,
        total_duration: row.get(5)?,
        event_count: row.get(6)?,
    })
}

/// Replace-all-for-date. Callers wrap this in a transaction.
pub fn replace_core_events(conn: &Connection, date: Date, events: &[CoreEvent]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM core_events WHERE date = ?1", [date.to_string()])?;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO core_events ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    ))?;
    for e in events {
        stmt.execute((
            e.date.to_string(),
            e.category.as_str(),
            e.rank,
            &e.app_name,
            &e.clean_title,
            e.total_duration,
            e.event_count,
        ))?;
    }
    Ok(())
}

/// Focus rows first, each category in rank order.
pub fn list_core_events(conn: &Connection, date: Date) -> rusqlite::Result<Vec<CoreEvent>> {
    list_core_events_between(conn, date, date)
}

pub fn list_core_events_between(
    conn: &Connection,
    start: Date,
    end: Date,
) -> rusqlite::Result<Vec<CoreEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM core_events WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC, CASE category WHEN 'focus' THEN 0 ELSE 1 END, rank ASC"
    ))?;
    let rows = stmt.query_map((start.to_string(), end.to_string()), event_from_row)?;
    rows.collect()
}
