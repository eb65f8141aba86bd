use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;
use time::{Date, UtcOffset};
use tracing::{info, warn};

use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::model::{iso_date, DailyAggregate, Session, Status};

/// Folds one closed session into the running totals for its date.
pub fn apply_session(mut d: DailyAggregate, status: Status, duration: i64) -> DailyAggregate {
    if status.is_focus_like() {
        d.total_focus_time += duration;
        d.current_focus_streak += duration;
        d.max_focus_streak = d.max_focus_streak.max(d.current_focus_streak);
    } else {
        if status == Status::Entertainment {
            d.total_entertainment_time += duration;
        }
        d.current_focus_streak = 0;
    }
    d.efficiency_score = metrics::efficiency_score(d.total_focus_time, d.willpower_wins);
    d
}

/// Pure re-derivation of a day from its sessions. `summary_text` is carried over
/// because it is not derived from sessions.
pub fn derive_daily(date: Date, sessions: &[Session], summary_text: &str) -> DailyAggregate {
    let total_focus_time = metrics::focus_total(sessions);
    let willpower_wins = metrics::willpower_wins(sessions);
    DailyAggregate {
        date,
        total_focus_time,
        total_entertainment_time: metrics::entertainment_total(sessions),
        max_focus_streak: metrics::max_focus_streak(sessions),
        current_focus_streak: metrics::current_focus_streak(sessions),
        efficiency_score: metrics::efficiency_score(total_focus_time, willpower_wins),
        willpower_wins,
        summary_text: summary_text.to_string(),
    }
}

pub fn accumulate_in(conn: &Connection, date: Date, status: Status, duration: i64) -> CoreResult<DailyAggregate> {
    if duration < 0 {
        let at = date.midnight().assume_utc();
        return Err(CoreError::NegativeDuration {
            start: at,
            end: at + time::Duration::seconds(duration),
        });
    }
    let current = db::daily::load_daily(conn, date)?.unwrap_or_else(|| DailyAggregate::empty(date));
    let next = apply_session(current, status, duration);
    db::daily::upsert_daily(conn, &next)?;
    Ok(next)
}

/// Adds `duration` to the running totals of `date` (upsert).
pub fn accumulate(conn: &mut Connection, date: Date, status: Status, duration: i64) -> CoreResult<DailyAggregate> {
    db::write_tx(conn, |tx| accumulate_in(tx, date, status, duration))
}

pub fn reconcile_in(conn: &Connection, date: Date, tz: UtcOffset) -> CoreResult<DailyAggregate> {
    let sessions = db::sessions::list_sessions_for_date(conn, date, tz)?;
    let summary = db::daily::load_daily(conn, date)?
        .map(|d| d.summary_text)
        .unwrap_or_default();
    let fresh = derive_daily(date, &sessions, &summary);
    db::daily::upsert_daily(conn, &fresh)?;
    Ok(fresh)
}

/// Recomputes `date` from its sessions and overwrites the stored row.
pub fn reconcile(conn: &mut Connection, date: Date, tz: UtcOffset) -> CoreResult<DailyAggregate> {
    db::write_tx(conn, |tx| reconcile_in(tx, date, tz))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub focus: i64,
    pub entertainment: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    #[serde(with = "iso_date")]
    pub date: Date,
    /// `None` when the date had no stored row.
    pub before: Option<Totals>,
    pub after: Totals,
}

/// Compares stored totals with session sums and reconciles every date that is
/// missing or off by more than `tolerance_seconds`.
///
/// Covers every date with sessions or a stored row, optionally limited to `range`.
pub fn check(
    conn: &mut Connection,
    tz: UtcOffset,
    tolerance_seconds: i64,
    range: Option<(Date, Date)>,
) -> CoreResult<Vec<Discrepancy>> {
    let mut dates: BTreeSet<Date> = db::sessions::session_dates(conn, tz)?;
    dates.extend(db::daily::daily_dates(conn)?);
    if let Some((start, end)) = range {
        dates.retain(|d| *d >= start && *d <= end);
    }

    let mut out = Vec::new();
    for date in dates {
        let found = db::write_tx(conn, |tx| {
            let sessions = db::sessions::list_sessions_for_date(tx, date, tz)?;
            let computed = Totals {
                focus: metrics::focus_total(&sessions),
                entertainment: metrics::entertainment_total(&sessions),
            };
            let stored = db::daily::load_daily(tx, date)?.map(|d| Totals {
                focus: d.total_focus_time,
                entertainment: d.total_entertainment_time,
            });
            let off = match stored {
                None => true,
                Some(s) => {
                    (s.focus - computed.focus).abs() > tolerance_seconds
                        || (s.entertainment - computed.entertainment).abs() > tolerance_seconds
                }
            };
            if !off {
                return Ok(None);
            }
            let fixed = reconcile_in(tx, date, tz)?;
            Ok(Some(Discrepancy {
                date,
                before: stored,
                after: Totals {
                    focus: fixed.total_focus_time,
                    entertainment: fixed.total_entertainment_time,
                },
            }))
        })?;

        if let Some(d) = found {
            match d.before {
                Some(b) => warn!(
                    date = %d.date,
                    focus_before = b.focus,
                    focus_after = d.after.focus,
                    ent_before = b.entertainment,
                    ent_after = d.after.entertainment,
                    "daily aggregate corrected"
                ),
                None => warn!(
                    date = %d.date,
                    focus_after = d.after.focus,
                    ent_after = d.after.entertainment,
                    "daily aggregate was missing, created"
                ),
            }
            out.push(d);
        }
    }
    info!(corrected = out.len(), "consistency check done");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_date;
    use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&mut conn).unwrap();
        conn
    }

    fn insert(conn: &Connection, status: Status, from: i64, to: i64) -> Session {
        let base = OffsetDateTime::parse("2026-02-15T09:00:00Z", &Rfc3339).unwrap();
        let m = |mins: i64| base + Duration::minutes(mins);
        let s = Session::new(status, m(from), m(to), "t", "p.exe").unwrap();
        db::sessions::insert_session(conn, &s).unwrap();
        s
    }

    fn date() -> Date {
        parse_date("2026-02-15").unwrap()
    }

    #[test]
    fn accumulate_upserts_running_totals() {
        let mut conn = setup();
        accumulate(&mut conn, date(), Status::Focus, 600).unwrap();
        accumulate(&mut conn, date(), Status::Work, 300).unwrap();
        accumulate(&mut conn, date(), Status::Entertainment, 120).unwrap();
        let d = accumulate(&mut conn, date(), Status::Focus, 60).unwrap();

        assert_eq!(d.total_focus_time, 960);
        assert_eq!(d.total_entertainment_time, 120);
        assert_eq!(d.max_focus_streak, 900);
        assert_eq!(d.current_focus_streak, 60);
        assert!(d.max_focus_streak >= d.current_focus_streak);
        assert_eq!(db::daily::load_daily(&conn, date()).unwrap(), Some(d));
    }

    #[test]
    fn accumulate_rejects_negative_duration() {
        let mut conn = setup();
        let err = accumulate(&mut conn, date(), Status::Focus, -5).unwrap_err();
        assert!(matches!(err, CoreError::NegativeDuration { .. }));
        assert!(db::daily::load_daily(&conn, date()).unwrap().is_none());
    }

    #[test]
    fn reconcile_is_idempotent_and_conserves_duration() {
        let mut conn = setup();
        insert(&conn, Status::Focus, 0, 50);
        insert(&conn, Status::Entertainment, 50, 64);
        insert(&conn, Status::Work, 64, 109);
        insert(&conn, Status::Idle, 109, 120);

        // Drift the stored row first.
        accumulate(&mut conn, date(), Status::Focus, 99_999).unwrap();

        let tz = UtcOffset::UTC;
        let once = reconcile(&mut conn, date(), tz).unwrap();
        let twice = reconcile(&mut conn, date(), tz).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.total_focus_time, 95 * 60);
        assert_eq!(once.total_entertainment_time, 14 * 60);
        assert_eq!(once.max_focus_streak, 50 * 60);
        assert_eq!(once.current_focus_streak, 0);
        assert_eq!(once.efficiency_score, metrics::efficiency_score(95 * 60, 0));
    }

    #[test]
    fn reconcile_empty_day_writes_zero_row() {
        let mut conn = setup();
        let d = reconcile(&mut conn, date(), UtcOffset::UTC).unwrap();
        assert_eq!(d.total_focus_time, 0);
        assert_eq!(d.max_focus_streak, 0);
        assert_eq!(d.efficiency_score, 60);
    }

    #[test]
    fn reconcile_keeps_summary_text() {
        let mut conn = setup();
        insert(&conn, Status::Focus, 0, 10);
        let mut d = DailyAggregate::empty(date());
        d.summary_text = "shipped the release".to_string();
        db::daily::upsert_daily(&conn, &d).unwrap();

        let fresh = reconcile(&mut conn, date(), UtcOffset::UTC).unwrap();
        assert_eq!(fresh.summary_text, "shipped the release");
        assert_eq!(fresh.total_focus_time, 600);
    }

    #[test]
    fn check_reports_and_fixes_drift() {
        let mut conn = setup();
        insert(&conn, Status::Focus, 0, 30);
        insert(&conn, Status::Entertainment, 30, 40);

        // Missing row: created.
        let found = check(&mut conn, UtcOffset::UTC, 60, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].before, None);
        assert_eq!(found[0].after, Totals { focus: 1800, entertainment: 600 });

        // Within tolerance: left alone.
        accumulate(&mut conn, date(), Status::Focus, 60).unwrap();
        assert!(check(&mut conn, UtcOffset::UTC, 60, None).unwrap().is_empty());

        // Beyond tolerance: before/after reported and the row is restored.
        accumulate(&mut conn, date(), Status::Focus, 1).unwrap();
        let found = check(&mut conn, UtcOffset::UTC, 60, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].before, Some(Totals { focus: 1861, entertainment: 600 }));
        assert_eq!(found[0].after.focus, 1800);
        assert!(check(&mut conn, UtcOffset::UTC, 60, None).unwrap().is_empty());
    }

    #[test]
    fn check_covers_rows_without_sessions_and_honors_range() {
        let mut conn = setup();
        let other = parse_date("2026-02-10").unwrap();
        accumulate(&mut conn, other, Status::Focus, 3600).unwrap();

        let found = check(&mut conn, UtcOffset::UTC, 60, Some((date(), date()))).unwrap();
        assert!(found.is_empty());

        let found = check(&mut conn, UtcOffset::UTC, 60, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].date, other);
        assert_eq!(found[0].after.focus, 0);
    }
}
