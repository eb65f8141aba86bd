use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, Date, Duration, OffsetDateTime, UtcOffset};

use crate::error::{CoreError, CoreResult};

/// Activity label attached to every observation and session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Focus,
    Work,
    Entertainment,
    Idle,
    Other,
    Unknown,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Focus,
        Status::Work,
        Status::Entertainment,
        Status::Idle,
        Status::Other,
        Status::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Focus => "focus",
            Status::Work => "work",
            Status::Entertainment => "entertainment",
            Status::Idle => "idle",
            Status::Other => "other",
            Status::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        let s = raw.trim();
        Status::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownStatus(raw.to_string()))
    }

    /// Counted toward productive time.
    pub fn is_focus_like(self) -> bool {
        matches!(self, Status::Focus | Status::Work)
    }

    pub fn is_distraction_like(self) -> bool {
        matches!(self, Status::Entertainment | Status::Other | Status::Unknown)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Focus,
    Entertainment,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Focus => "focus",
            Category::Entertainment => "entertainment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "focus" => Some(Category::Focus),
            "entertainment" => Some(Category::Entertainment),
            _ => None,
        }
    }

    pub fn of_status(status: Status) -> Option<Self> {
        match status {
            Status::Focus | Status::Work => Some(Category::Focus),
            Status::Entertainment => Some(Category::Entertainment),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    /// Whole seconds, always `end - start`.
    pub duration: i64,
    pub window_title: String,
    pub process_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Session {
    pub fn new(
        status: Status,
        start: OffsetDateTime,
        end: OffsetDateTime,
        window_title: impl Into<String>,
        process_name: impl Into<String>,
    ) -> CoreResult<Self> {
        let start = truncate_to_second(start);
        let end = truncate_to_second(end);
        if end < start {
            return Err(CoreError::NegativeDuration { start, end });
        }
        Ok(Self {
            status,
            start,
            end,
            duration: (end - start).whole_seconds(),
            window_title: window_title.into(),
            process_name: process_name.into(),
            summary: None,
        })
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DailyAggregate {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub total_focus_time: i64,
    pub total_entertainment_time: i64,
    pub max_focus_streak: i64,
    pub current_focus_streak: i64,
    pub efficiency_score: i64,
    pub willpower_wins: i64,
    pub summary_text: String,
}

impl DailyAggregate {
    pub fn empty(date: Date) -> Self {
        Self {
            date,
            total_focus_time: 0,
            total_entertainment_time: 0,
            max_focus_streak: 0,
            current_focus_streak: 0,
            efficiency_score: 0,
            willpower_wins: 0,
            summary_text: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeriodStats {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub total_focus: i64,
    pub total_entertainment: i64,
    pub max_streak: i64,
    pub willpower_wins: i64,
    pub peak_hour: u8,
    pub efficiency_score: i64,
    pub daily_summary: String,
    pub focus_fragmentation_ratio: f64,
    pub context_switch_freq: f64,
    pub ai_insight: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoreEvent {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub category: Category,
    pub rank: i64,
    pub app_name: String,
    pub clean_title: String,
    pub total_duration: i64,
    pub event_count: i64,
}

pub fn truncate_to_second(t: OffsetDateTime) -> OffsetDateTime {
    t - Duration::nanoseconds(t.nanosecond() as i64)
}

/// Storage form: RFC 3339 in UTC with whole seconds, so string order is time order.
pub fn fmt_ts(t: OffsetDateTime) -> String {
    truncate_to_second(t)
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn parse_ts(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

pub fn parse_date(input: &str) -> CoreResult<Date> {
    let bad = || CoreError::InvalidDate(input.to_string());
    let parts: Vec<&str> = input.trim().split('-').collect();
    if parts.len() != 3 {
        return Err(bad());
    }
    let y: i32 = parts[0].parse().map_err(|_| bad())?;
    let m: u8 = parts[1].parse().map_err(|_| bad())?;
    let d: u8 = parts[2].parse().map_err(|_| bad())?;
    let month = time::Month::try_from(m).map_err(|_| bad())?;
    Date::from_calendar_date(y, month, d).map_err(|_| bad())
}

/// `[local midnight, next local midnight)` for `date`, expressed in UTC.
pub fn day_window(date: Date, tz: UtcOffset) -> (OffsetDateTime, OffsetDateTime) {
    let start = date
        .midnight()
        .assume_offset(tz)
        .to_offset(UtcOffset::UTC);
    (start, start + Duration::days(1))
}

pub fn local_date(t: OffsetDateTime, tz: UtcOffset) -> Date {
    t.to_offset(tz).date()
}

/// Inclusive range of calendar dates. Empty when `end < start`.
pub fn dates_between(start: Date, end: Date) -> Vec<Date> {
    let mut out = Vec::new();
    let mut d = start;
    while d <= end {
        out.push(d);
        match d.next_day() {
            Some(n) => d = n,
            None => break,
        }
    }
    out
}

pub mod iso_date {
    use serde::Serializer;
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.to_string())
    }
}
