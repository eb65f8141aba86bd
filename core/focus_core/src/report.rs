use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;
use time::{Date, UtcOffset};

use crate::aggregator::{fmt_hhmm, TimelineSegment};
use crate::db;
use crate::error::CoreResult;
use crate::model::{day_window, iso_date, local_date, Category, Session};
use crate::pipeline::DayReport;

pub fn export_markdown(day: &DayReport, timeline: &[TimelineSegment]) -> String {
    let p = &day.period;
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", day.date));
    out.push_str(&format!("{}\n\n", p.daily_summary));

    out.push_str(&format!("- Focus: {}\n", fmt_duration(p.total_focus)));
    out.push_str(&format!("- Entertainment: {}\n", fmt_duration(p.total_entertainment)));
    out.push_str(&format!("- Longest streak: {}\n", fmt_duration(p.max_streak)));
    out.push_str(&format!("- Willpower wins: {}\n", p.willpower_wins));
    out.push_str(&format!("- Peak hour: {:02}:00\n", p.peak_hour));
    out.push_str(&format!("- Efficiency: {}\n", p.efficiency_score));
    out.push_str(&format!(
        "- Focus/fragmentation: {:.2} · switches/h: {:.1}\n",
        p.focus_fragmentation_ratio, p.context_switch_freq
    ));
    out.push_str(&format!("- Insight: {}\n", p.ai_insight));

    for category in [Category::Focus, Category::Entertainment] {
        let items: Vec<_> = day.core_events.iter().filter(|e| e.category == category).collect();
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## Top {}\n", category.as_str()));
        for e in items {
            out.push_str(&format!(
                "{}. {} · {} {} ({}x)\n",
                e.rank,
                e.clean_title,
                e.app_name,
                fmt_duration(e.total_duration),
                e.event_count
            ));
        }
    }

    if !timeline.is_empty() {
        out.push_str("\n## Timeline\n");
        for seg in timeline {
            out.push_str(&format!(
                "- {}–{} {} {}m\n",
                seg.start_label,
                seg.end_label,
                seg.status.as_str(),
                seg.display_minutes
            ));
        }
    }

    out
}

pub fn export_csv(day: &DayReport) -> String {
    let p = &day.period;
    let mut out = String::new();
    out.push_str("date,total_focus,total_entertainment,max_streak,willpower_wins,peak_hour,efficiency_score,daily_summary,focus_fragmentation_ratio,context_switch_freq,ai_insight,category,rank,app_name,clean_title,total_duration,event_count\n");

    let head = vec![
        csv_escape(&day.date.to_string()),
        p.total_focus.to_string(),
        p.total_entertainment.to_string(),
        p.max_streak.to_string(),
        p.willpower_wins.to_string(),
        p.peak_hour.to_string(),
        p.efficiency_score.to_string(),
        csv_escape(&p.daily_summary),
        format!("{:.2}", p.focus_fragmentation_ratio),
        format!("{:.1}", p.context_switch_freq),
        csv_escape(&p.ai_insight),
    ];

    if day.core_events.is_empty() {
        let mut row = head.clone();
        row.extend(std::iter::repeat(String::new()).take(6));
        out.push_str(&row.join(","));
        out.push('\n');
        return out;
    }

    for e in &day.core_events {
        let mut row = head.clone();
        row.push(e.category.as_str().to_string());
        row.push(e.rank.to_string());
        row.push(csv_escape(&e.app_name));
        row.push(csv_escape(&e.clean_title));
        row.push(e.total_duration.to_string());
        row.push(e.event_count.to_string());
        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

fn csv_escape(s: &str) -> String {
    let needs_quote = s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r');
    if !needs_quote {
        return s.to_string();
    }
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn fmt_duration(seconds: i64) -> String {
    if seconds <= 0 {
        return "0m".to_string();
    }
    let m = (seconds + 30) / 60;
    if m < 60 {
        return format!("{m}m");
    }
    let h = m / 60;
    let rm = m % 60;
    if rm == 0 {
        format!("{h}h")
    } else {
        format!("{h}h {rm}m")
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DayRow {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub focus_hours: f64,
    pub longest_minutes: i64,
    pub summary: String,
}

/// Longest single focus session of a range.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeakSession {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub start_label: String,
    pub end_label: String,
    pub minutes: i64,
    pub process_name: String,
    pub window_title: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RangeSummary {
    #[serde(with = "iso_date")]
    pub start: Date,
    #[serde(with = "iso_date")]
    pub end: Date,
    pub total_focus_hours: f64,
    pub willpower_wins: i64,
    /// Each win is credited with five reclaimed minutes.
    pub willpower_saved_minutes: i64,
    pub avg_efficiency: i64,
    pub efficiency_level: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_day: Option<DayRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_session: Option<PeakSession>,
    pub top_apps: Vec<String>,
    pub days: Vec<DayRow>,
}

pub fn efficiency_level(score: i64) -> &'static str {
    if score >= 80 {
        "excellent"
    } else if score >= 60 {
        "good"
    } else {
        "needs improvement"
    }
}

pub const MINUTES_SAVED_PER_WIN: i64 = 5;

fn hours_1dp(seconds: i64) -> f64 {
    (seconds as f64 / 360.0).round() / 10.0
}

/// Multi-day rollup over stored aggregates, period stats and core events.
pub fn range_summary(conn: &Connection, start: Date, end: Date, tz: UtcOffset) -> CoreResult<RangeSummary> {
    let dailies = db::daily::list_daily_between(conn, start, end)?;
    let periods = db::period::list_period_between(conn, start, end)?;
    let events = db::core_events::list_core_events_between(conn, start, end)?;

    let summaries: HashMap<Date, &str> = periods
        .iter()
        .map(|p| (p.date, p.daily_summary.as_str()))
        .collect();

    let days: Vec<DayRow> = dailies
        .iter()
        .map(|d| DayRow {
            date: d.date,
            focus_hours: hours_1dp(d.total_focus_time),
            longest_minutes: d.max_focus_streak / 60,
            summary: summaries.get(&d.date).copied().unwrap_or("").to_string(),
        })
        .collect();

    let total_focus: i64 = dailies.iter().map(|d| d.total_focus_time).sum();
    let willpower_wins: i64 = dailies.iter().map(|d| d.willpower_wins).sum();
    let avg_efficiency = if dailies.is_empty() {
        0
    } else {
        dailies.iter().map(|d| d.efficiency_score).sum::<i64>() / dailies.len() as i64
    };

    // First day wins ties.
    let peak_day = dailies
        .iter()
        .zip(days.iter())
        .fold(None::<(i64, &DayRow)>, |best, (d, row)| match best {
            Some((b, _)) if b >= d.total_focus_time => best,
            _ => Some((d.total_focus_time, row)),
        })
        .map(|(_, row)| row.clone());

    let (from, _) = day_window(start, tz);
    let (_, to) = day_window(end, tz);
    let sessions = db::sessions::list_sessions_between(conn, from, to)?;
    let peak_session = sessions
        .iter()
        .filter(|s| s.status.is_focus_like())
        .fold(None::<&Session>, |best, s| match best {
            Some(b) if b.duration >= s.duration => best,
            _ => Some(s),
        })
        .map(|s| PeakSession {
            date: local_date(s.start, tz),
            start_label: fmt_hhmm(s.start, tz),
            end_label: fmt_hhmm(s.end, tz),
            minutes: s.duration / 60,
            process_name: s.process_name.clone(),
            window_title: s.window_title.clone(),
        });

    let mut apps: Vec<(String, i64)> = Vec::new();
    for e in &events {
        if e.app_name.is_empty() {
            continue;
        }
        match apps.iter_mut().find(|(name, _)| *name == e.app_name) {
            Some((_, total)) => *total += e.total_duration,
            None => apps.push((e.app_name.clone(), e.total_duration)),
        }
    }
    apps.sort_by(|a, b| b.1.cmp(&a.1));
    apps.truncate(3);

    Ok(RangeSummary {
        start,
        end,
        total_focus_hours: hours_1dp(total_focus),
        willpower_wins,
        willpower_saved_minutes: willpower_wins * MINUTES_SAVED_PER_WIN,
        avg_efficiency,
        efficiency_level: efficiency_level(avg_efficiency),
        peak_day,
        peak_session,
        top_apps: apps.into_iter().map(|(name, _)| name).collect(),
        days,
    })
}

pub fn range_markdown(r: &RangeSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} – {}\n\n", r.start, r.end));
    out.push_str(&format!("- Focus: {}h\n", r.total_focus_hours));
    out.push_str(&format!(
        "- Willpower wins: {} ({}m reclaimed)\n",
        r.willpower_wins, r.willpower_saved_minutes
    ));
    out.push_str(&format!(
        "- Efficiency: {} ({})\n",
        r.avg_efficiency, r.efficiency_level
    ));
    if let Some(peak) = &r.peak_day {
        out.push_str(&format!("- Peak day: {} ({}h)\n", peak.date, peak.focus_hours));
    }
    if let Some(p) = &r.peak_session {
        out.push_str(&format!(
            "- Longest flow: {} {}–{} ({}m)\n",
            p.date, p.start_label, p.end_label, p.minutes
        ));
    }
    if !r.top_apps.is_empty() {
        out.push_str(&format!("- Top apps: {}\n", r.top_apps.join(", ")));
    }

    if !r.days.is_empty() {
        out.push_str("\n| Date | Focus | Longest | Summary |\n|---|---|---|---|\n");
        for d in &r.days {
            out.push_str(&format!(
                "| {} | {}h | {}m | {} |\n",
                d.date, d.focus_hours, d.longest_minutes, d.summary
            ));
        }
    }
    out
}
