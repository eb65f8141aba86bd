use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

pub const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
pub const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;
pub const DEFAULT_MAX_GAP_SECONDS: i64 = 120;
pub const DEFAULT_DISPLAY_GAP_SECONDS: i64 = 30;
pub const DEFAULT_TOP_K: i64 = 5;
pub const DEFAULT_DISCREPANCY_TOLERANCE_SECONDS: i64 = 60;

/// Where PeriodStats takes its total-focus and total-entertainment figures from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusTotalSource {
    /// Stored DailyAggregate row when present, session sum otherwise.
    #[default]
    DailyAggregate,
    Sessions,
}

impl FocusTotalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FocusTotalSource::DailyAggregate => "daily_aggregate",
            FocusTotalSource::Sessions => "sessions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "daily_aggregate" => Some(FocusTotalSource::DailyAggregate),
            "sessions" => Some(FocusTotalSource::Sessions),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    pub max_gap_seconds: i64,
    pub display_gap_seconds: i64,
    pub tz_offset_minutes: i32,
    pub top_k: i64,
    pub discrepancy_tolerance_seconds: i64,
    pub focus_total_source: FocusTotalSource,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_gap_seconds: DEFAULT_MAX_GAP_SECONDS,
            display_gap_seconds: DEFAULT_DISPLAY_GAP_SECONDS,
            tz_offset_minutes: 0,
            top_k: DEFAULT_TOP_K,
            discrepancy_tolerance_seconds: DEFAULT_DISCREPANCY_TOLERANCE_SECONDS,
            focus_total_source: FocusTotalSource::default(),
        }
    }
}

impl Settings {
    pub fn clamped(self) -> Self {
        Self {
            max_gap_seconds: self.max_gap_seconds.clamp(1, 3600),
            display_gap_seconds: self.display_gap_seconds.clamp(0, 3600),
            tz_offset_minutes: normalize_tz_offset_minutes(Some(self.tz_offset_minutes)),
            top_k: self.top_k.clamp(1, 10),
            discrepancy_tolerance_seconds: self.discrepancy_tolerance_seconds.max(0),
            focus_total_source: self.focus_total_source,
        }
    }

    pub fn tz(&self) -> UtcOffset {
        tz_offset_from_minutes(self.tz_offset_minutes)
    }
}

pub fn normalize_tz_offset_minutes(v: Option<i32>) -> i32 {
    v.unwrap_or(0)
        .clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX)
}

pub fn tz_offset_from_minutes(minutes: i32) -> UtcOffset {
    UtcOffset::from_whole_seconds(minutes.saturating_mul(60)).unwrap_or(UtcOffset::UTC)
}

pub fn load_or_init_settings(conn: &Connection, defaults: Settings) -> rusqlite::Result<Settings> {
    if let Some(settings) = load_app_settings(conn)? {
        let fixed = settings.clamped();
        if fixed != settings {
            upsert_app_settings(conn, fixed)?;
        }
        return Ok(fixed);
    }

    let fixed = defaults.clamped();
    upsert_app_settings(conn, fixed)?;
    Ok(fixed)
}

pub fn load_app_settings(conn: &Connection) -> rusqlite::Result<Option<Settings>> {
    let mut stmt = conn.prepare(
        "SELECT max_gap_seconds, display_gap_seconds, tz_offset_minutes, top_k, discrepancy_tolerance_seconds, focus_total_source FROM app_settings WHERE id = 1",
    )?;
    match stmt.query_row([], |row| {
        let source: String = row.get(5)?;
        Ok(Settings {
            max_gap_seconds: row.get(0)?,
            display_gap_seconds: row.get(1)?,
            tz_offset_minutes: row.get(2)?,
            top_k: row.get(3)?,
            discrepancy_tolerance_seconds: row.get(4)?,
            focus_total_source: FocusTotalSource::parse(&source).unwrap_or_default(),
        })
    }) {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn upsert_app_settings(conn: &Connection, settings: Settings) -> rusqlite::Result<()> {
    let updated_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    conn.execute(
        r#"
INSERT INTO app_settings (id, max_gap_seconds, display_gap_seconds, tz_offset_minutes, top_k, discrepancy_tolerance_seconds, focus_total_source, updated_at)
VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(id) DO UPDATE SET
  max_gap_seconds=excluded.max_gap_seconds,
  display_gap_seconds=excluded.display_gap_seconds,
  tz_offset_minutes=excluded.tz_offset_minutes,
  top_k=excluded.top_k,
  discrepancy_tolerance_seconds=excluded.discrepancy_tolerance_seconds,
  focus_total_source=excluded.focus_total_source,
  updated_at=excluded.updated_at
        "#,
        (
            settings.max_gap_seconds,
            settings.display_gap_seconds,
            settings.tz_offset_minutes,
            settings.top_k,
            settings.discrepancy_tolerance_seconds,
            settings.focus_total_source.as_str(),
            updated_at,
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn load_or_init_settings_persists_and_clamps() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&mut conn).unwrap();

        let defaults = Settings {
            max_gap_seconds: 0,
            tz_offset_minutes: 20 * 60,
            top_k: 50,
            ..Settings::default()
        };
        let s = load_or_init_settings(&conn, defaults).unwrap();
        assert_eq!(s.max_gap_seconds, 1);
        assert_eq!(s.tz_offset_minutes, TZ_OFFSET_MINUTES_MAX);
        assert_eq!(s.top_k, 10);

        // Stored row wins over new defaults.
        let again = load_or_init_settings(&conn, Settings::default()).unwrap();
        assert_eq!(again, s);
    }

    #[test]
    fn focus_total_source_round_trips_through_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&mut conn).unwrap();
        let s = Settings {
            focus_total_source: FocusTotalSource::Sessions,
            ..Settings::default()
        };
        upsert_app_settings(&conn, s).unwrap();
        let loaded = load_app_settings(&conn).unwrap().unwrap();
        assert_eq!(loaded.focus_total_source, FocusTotalSource::Sessions);
    }

    #[test]
    fn tz_offset_from_minutes_works() {
        assert_eq!(tz_offset_from_minutes(8 * 60).whole_hours(), 8);
        assert_eq!(tz_offset_from_minutes(-330).whole_minutes(), -330);
    }
}
