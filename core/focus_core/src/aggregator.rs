use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::error::{CoreError, CoreResult};
use crate::model::{fmt_ts, truncate_to_second, Session, Status};

/// One classifier sample.
#[derive(Clone, Debug, Deserialize)]
pub struct Observation {
    pub status: String,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(default)]
    pub window_title: Option<String>,
    #[serde(default)]
    pub process_name: Option<String>,
}

impl Observation {
    pub fn new(status: &str, timestamp: f64) -> Self {
        Self {
            status: status.to_string(),
            timestamp,
            window_title: None,
            process_name: None,
        }
    }

    pub fn with_window(mut self, process_name: &str, window_title: &str) -> Self {
        self.process_name = Some(process_name.to_string());
        self.window_title = Some(window_title.to_string());
        self
    }
}

pub fn observation_time(ts: f64) -> CoreResult<OffsetDateTime> {
    if !ts.is_finite() {
        return Err(CoreError::InvalidTimestamp(ts));
    }
    OffsetDateTime::from_unix_timestamp(ts.floor() as i64).map_err(|_| CoreError::InvalidTimestamp(ts))
}

#[derive(Clone, Debug)]
struct WindowTally {
    process_name: String,
    window_title: String,
    count: u32,
}

/// The run of same-status observations not yet emitted as a Session.
#[derive(Clone, Debug)]
pub struct OpenRun {
    pub open_status: Status,
    pub open_start: OffsetDateTime,
    pub last_observation_time: OffsetDateTime,
    windows: Vec<WindowTally>,
}

impl OpenRun {
    fn start(status: Status, at: OffsetDateTime, process_name: &str, window_title: &str) -> Self {
        let mut run = Self {
            open_status: status,
            open_start: at,
            last_observation_time: at,
            windows: Vec::new(),
        };
        run.tally(process_name, window_title);
        run
    }

    fn tally(&mut self, process_name: &str, window_title: &str) {
        if let Some(w) = self
            .windows
            .iter_mut()
            .find(|w| w.process_name == process_name && w.window_title == window_title)
        {
            w.count += 1;
            return;
        }
        self.windows.push(WindowTally {
            process_name: process_name.to_string(),
            window_title: window_title.to_string(),
            count: 1,
        });
    }

    fn close(self, end: OffsetDateTime) -> CoreResult<Session> {
        // First seen wins ties.
        let mut best: Option<&WindowTally> = None;
        for w in &self.windows {
            if best.map_or(true, |b| w.count > b.count) {
                best = Some(w);
            }
        }
        let (process, title) = best
            .map(|w| (w.process_name.clone(), w.window_title.clone()))
            .unwrap_or_default();
        Session::new(self.open_status, self.open_start, end, title, process)
    }
}

/// Merges an ordered observation stream into Sessions.
///
/// An observation extends the open run when its status matches and it arrives within
/// `max_gap_seconds` of the previous observation. Anything else closes the run.
/// When a run closes on a status change inside the gap tolerance, its end is bridged
/// to the new observation so consecutive sessions stay contiguous.
#[derive(Clone, Debug)]
pub struct SessionAggregator {
    max_gap_seconds: i64,
    open: Option<OpenRun>,
    watermark: Option<OffsetDateTime>,
    /// Observations at or before this instant are already covered by stored sessions.
    floor: Option<OffsetDateTime>,
}

impl SessionAggregator {
    pub fn new(max_gap_seconds: i64) -> Self {
        Self {
            max_gap_seconds: max_gap_seconds.max(0),
            open: None,
            watermark: None,
            floor: None,
        }
    }

    /// Continues after previously stored history ending at `stored_end`.
    pub fn resume_after(mut self, stored_end: Option<OffsetDateTime>) -> Self {
        self.floor = stored_end.map(truncate_to_second);
        self
    }

    pub fn max_gap_seconds(&self) -> i64 {
        self.max_gap_seconds
    }

    pub fn open_run(&self) -> Option<&OpenRun> {
        self.open.as_ref()
    }

    /// Returns the session closed by this observation, if any.
    /// Invalid input is rejected without touching the open run.
    pub fn push(&mut self, obs: &Observation) -> CoreResult<Option<Session>> {
        let status = Status::parse(&obs.status)?;
        let at = observation_time(obs.timestamp)?;
        if let Some(floor) = self.floor {
            if at <= floor {
                return Err(CoreError::NonMonotonic { previous: floor, got: at });
            }
        }
        if let Some(previous) = self.watermark {
            if at < previous {
                return Err(CoreError::NonMonotonic { previous, got: at });
            }
        }
        self.watermark = Some(at);

        let process = obs.process_name.as_deref().unwrap_or("").trim();
        let title = obs.window_title.as_deref().unwrap_or("").trim();

        let Some(mut run) = self.open.take() else {
            self.open = Some(OpenRun::start(status, at, process, title));
            return Ok(None);
        };

        let gap = (at - run.last_observation_time).whole_seconds();
        if run.open_status == status && gap <= self.max_gap_seconds {
            run.last_observation_time = at;
            run.tally(process, title);
            self.open = Some(run);
            return Ok(None);
        }

        let end = if gap <= self.max_gap_seconds {
            at
        } else {
            run.last_observation_time
        };
        self.open = Some(OpenRun::start(status, at, process, title));
        run.close(end).map(Some)
    }

    /// Emits the open run, ending at its last observation.
    pub fn flush(&mut self) -> CoreResult<Option<Session>> {
        match self.open.take() {
            Some(run) => {
                let end = run.last_observation_time;
                run.close(end).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Runs a whole stream through a fresh aggregator, flushing at the end.
pub fn aggregate(observations: &[Observation], max_gap_seconds: i64) -> CoreResult<Vec<Session>> {
    let mut agg = SessionAggregator::new(max_gap_seconds);
    let mut out = Vec::new();
    for obs in observations {
        if let Some(s) = agg.push(obs)? {
            out.push(s);
        }
    }
    if let Some(s) = agg.flush()? {
        out.push(s);
    }
    Ok(out)
}

/// Display-only merge of stored sessions.
#[derive(Clone, Debug, Serialize)]
pub struct TimelineSegment {
    pub status: Status,
    pub start_ts: String,
    pub end_ts: String,
    pub start_label: String,
    pub end_label: String,
    pub seconds: i64,
    /// Never below 1 so short segments still render.
    pub display_minutes: i64,
}

pub fn display_minutes(seconds: i64) -> i64 {
    ((seconds.max(0) + 30) / 60).max(1)
}

#[derive(Clone)]
struct SegmentAcc {
    status: Status,
    start: OffsetDateTime,
    end: OffsetDateTime,
}

fn push_or_merge_segment(out: &mut Vec<SegmentAcc>, seg: SegmentAcc, max_gap_seconds: i64) {
    if let Some(last) = out.last_mut() {
        let gap = (seg.start - last.end).whole_seconds();
        if last.status == seg.status && gap <= max_gap_seconds {
            if seg.end > last.end {
                last.end = seg.end;
            }
            return;
        }
    }
    out.push(seg);
}

pub fn consolidate(sessions: &[Session], max_gap_seconds: i64, tz: UtcOffset) -> Vec<TimelineSegment> {
    let mut acc: Vec<SegmentAcc> = Vec::new();
    for s in sessions {
        push_or_merge_segment(
            &mut acc,
            SegmentAcc {
                status: s.status,
                start: s.start,
                end: s.end,
            },
            max_gap_seconds,
        );
    }

    acc.into_iter()
        .map(|seg| {
            let seconds = (seg.end - seg.start).whole_seconds();
            TimelineSegment {
                status: seg.status,
                start_ts: fmt_ts(seg.start),
                end_ts: fmt_ts(seg.end),
                start_label: fmt_hhmm(seg.start, tz),
                end_label: fmt_hhmm(seg.end, tz),
                seconds,
                display_minutes: display_minutes(seconds),
            }
        })
        .collect()
}

pub fn fmt_hhmm(t: OffsetDateTime, tz: UtcOffset) -> String {
    let local = t.to_offset(tz);
    format!("{:02}:{:02}", local.hour(), local.minute())
}
