use std::collections::BTreeSet;
use std::io::BufRead;

use rusqlite::Connection;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::aggregator::{Observation, SessionAggregator};
use crate::config::Settings;
use crate::core_events;
use crate::daily;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use crate::model::{dates_between, iso_date, local_date, CoreEvent, DailyAggregate, PeriodStats, Session};

/// Everything the report layer may read for one date.
#[derive(Clone, Debug, Serialize)]
pub struct DayReport {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub daily: DailyAggregate,
    pub period: PeriodStats,
    pub core_events: Vec<CoreEvent>,
}

pub fn record_session_in(conn: &Connection, session: &Session, settings: &Settings) -> CoreResult<DailyAggregate> {
    // Stored sessions never overlap; bridged neighbours share an instant.
    if let Some(previous) = db::sessions::latest_end(conn)? {
        if session.start < previous {
            return Err(CoreError::NonMonotonic {
                previous,
                got: session.start,
            });
        }
    }
    db::sessions::insert_session(conn, session)?;
    let date = local_date(session.start, settings.tz());
    daily::accumulate_in(conn, date, session.status, session.duration)
}

/// Persists a closed session and folds it into its day's running totals atomically.
pub fn record_session(conn: &mut Connection, session: &Session, settings: &Settings) -> CoreResult<DailyAggregate> {
    db::write_tx(conn, |tx| record_session_in(tx, session, settings))
}

/// Pushes one observation; a session closed by it is recorded before returning.
pub fn ingest_observation(
    conn: &mut Connection,
    aggregator: &mut SessionAggregator,
    obs: &Observation,
    settings: &Settings,
) -> CoreResult<Option<Session>> {
    let closed = aggregator.push(obs)?;
    if let Some(s) = &closed {
        record_session(conn, s, settings)?;
    }
    Ok(closed)
}

pub fn flush_aggregator(
    conn: &mut Connection,
    aggregator: &mut SessionAggregator,
    settings: &Settings,
) -> CoreResult<Option<Session>> {
    let closed = aggregator.flush()?;
    if let Some(s) = &closed {
        record_session(conn, s, settings)?;
    }
    Ok(closed)
}

/// An aggregator that picks up after the stored sessions.
pub fn resume_aggregator(conn: &Connection, settings: &Settings) -> CoreResult<SessionAggregator> {
    let stored_end = db::sessions::latest_end(conn)?;
    Ok(SessionAggregator::new(settings.max_gap_seconds).resume_after(stored_end))
}

#[derive(Clone, Debug, Default)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
    /// Dates that received a new session.
    pub dates: BTreeSet<Date>,
}

/// Feeds JSON-lines observations through `aggregator`.
///
/// Lines that are not UTF-8, not JSON, or fail validation are counted and skipped.
/// The open run is flushed before returning, also when an I/O or storage error
/// stops the feed early.
pub fn ingest_lines<R: BufRead>(
    conn: &mut Connection,
    aggregator: &mut SessionAggregator,
    mut reader: R,
    settings: &Settings,
) -> CoreResult<IngestSummary> {
    let mut summary = IngestSummary::default();
    let fed = feed_lines(conn, aggregator, &mut reader, settings, &mut summary);
    let flushed = flush_aggregator(conn, aggregator, settings);
    if let Err(e) = fed {
        if let Err(flush_err) = flushed {
            warn!("flush after failed ingest also failed: {flush_err}");
        }
        return Err(e);
    }
    if let Some(s) = flushed? {
        summary.dates.insert(local_date(s.start, settings.tz()));
    }
    Ok(summary)
}

fn feed_lines<R: BufRead>(
    conn: &mut Connection,
    aggregator: &mut SessionAggregator,
    reader: &mut R,
    settings: &Settings,
    summary: &mut IngestSummary,
) -> CoreResult<()> {
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        line_no += 1;
        let line = match std::str::from_utf8(&buf) {
            Ok(l) => l.trim(),
            Err(e) => {
                summary.rejected += 1;
                warn!(line = line_no, "observation rejected: {e}");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        let result = serde_json::from_str::<Observation>(line)
            .map_err(CoreError::from)
            .and_then(|obs| ingest_observation(conn, aggregator, &obs, settings));
        match result {
            Ok(closed) => {
                summary.accepted += 1;
                if let Some(s) = closed {
                    summary.dates.insert(local_date(s.start, settings.tz()));
                }
            }
            Err(e) if e.is_validation() => {
                summary.rejected += 1;
                warn!(line = line_no, "observation rejected: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn recompute_day_in(conn: &Connection, date: Date, settings: &Settings) -> CoreResult<DayReport> {
    let daily = daily::reconcile_in(conn, date, settings.tz())?;
    let core_events = core_events::refresh_in(conn, date, settings)?;
    let period = metrics::refresh_in(conn, date, settings)?;
    // Period refresh may have rewritten the cached streak.
    let daily = db::daily::load_daily(conn, date)?.unwrap_or(daily);
    Ok(DayReport {
        date,
        daily,
        period,
        core_events,
    })
}

/// Reconcile, core-event extraction and period metrics for one date, as one transaction.
pub fn recompute_day(conn: &mut Connection, date: Date, settings: &Settings) -> CoreResult<DayReport> {
    let report = db::write_tx(conn, |tx| recompute_day_in(tx, date, settings))?;
    info!(
        %date,
        focus = report.daily.total_focus_time,
        wins = report.period.willpower_wins,
        score = report.period.efficiency_score,
        "day recomputed"
    );
    Ok(report)
}

pub fn recompute_range(conn: &mut Connection, start: Date, end: Date, settings: &Settings) -> CoreResult<Vec<DayReport>> {
    dates_between(start, end)
        .into_iter()
        .map(|d| recompute_day(conn, d, settings))
        .collect()
}

/// The last `days` local dates, ending today.
pub fn backfill(conn: &mut Connection, days: u32, settings: &Settings) -> CoreResult<Vec<DayReport>> {
    let today = local_date(OffsetDateTime::now_utc(), settings.tz());
    let start = today - time::Duration::days(days.saturating_sub(1) as i64);
    recompute_range(conn, start, today, settings)
}

/// Stored view of a date without recomputing it.
pub fn load_day(conn: &Connection, date: Date) -> CoreResult<Option<DayReport>> {
    let Some(period) = db::period::load_period_stats(conn, date)? else {
        return Ok(None);
    };
    let daily = db::daily::load_daily(conn, date)?.unwrap_or_else(|| DailyAggregate::empty(date));
    let core_events = db::core_events::list_core_events(conn, date)?;
    Ok(Some(DayReport {
        date,
        daily,
        period,
        core_events,
    }))
}
