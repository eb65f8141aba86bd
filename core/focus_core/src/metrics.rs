//! Day-level metrics derived from a date's sessions.
//!
//! Every function here is total: an empty day yields zeros, an empty string list,
//! or the placeholder summary. Session slices are expected in start-time order.

use rusqlite::Connection;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::debug;

use crate::config::{FocusTotalSource, Settings};
use crate::db;
use crate::error::CoreResult;
use crate::model::{Category, CoreEvent, DailyAggregate, PeriodStats, Session};

/// Focus sessions closer than this belong to the same streak.
pub const STREAK_GAP_SECONDS: i64 = 120;
pub const WILLPOWER_THRESHOLD_SECONDS: i64 = 300;
pub const SUMMARY_MAX_CHARS: usize = 30;
pub const NO_ACTIVITY_SUMMARY: &str = "no major activity";

const FRAGMENTATION_NO_DISTRACTION: f64 = 10.0;
const MIN_ACTIVE_HOURS: f64 = 0.5;

pub fn focus_total(sessions: &[Session]) -> i64 {
    sessions
        .iter()
        .filter(|s| s.status.is_focus_like())
        .map(|s| s.duration)
        .sum()
}

pub fn entertainment_total(sessions: &[Session]) -> i64 {
    sessions
        .iter()
        .filter(|s| Category::of_status(s.status) == Some(Category::Entertainment))
        .map(|s| s.duration)
        .sum()
}

/// Lengths of each focus streak in order.
fn focus_streaks(sessions: &[Session]) -> Vec<i64> {
    let mut out = Vec::new();
    let mut current = 0;
    let mut last_end: Option<OffsetDateTime> = None;
    for s in sessions.iter().filter(|s| s.status.is_focus_like()) {
        match last_end {
            Some(end) if (s.start - end).whole_seconds() < STREAK_GAP_SECONDS => current += s.duration,
            Some(_) => {
                out.push(current);
                current = s.duration;
            }
            None => current = s.duration,
        }
        last_end = Some(s.end);
    }
    if last_end.is_some() {
        out.push(current);
    }
    out
}

pub fn max_focus_streak(sessions: &[Session]) -> i64 {
    focus_streaks(sessions).into_iter().max().unwrap_or(0)
}

/// The streak still running at the day's last session; 0 if that session is not focus-like.
pub fn current_focus_streak(sessions: &[Session]) -> i64 {
    match sessions.last() {
        Some(last) if last.status.is_focus_like() => {
            focus_streaks(sessions).last().copied().unwrap_or(0)
        }
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WillpowerState {
    SeekingFocus,
    InFocus,
    Recovering,
}

/// Counts short lapses followed by a return to focus.
pub fn willpower_wins(sessions: &[Session]) -> i64 {
    use WillpowerState::*;

    let mut state = SeekingFocus;
    let mut wins = 0;
    for s in sessions {
        let focus = s.status.is_focus_like();
        let distraction = s.status.is_distraction_like();
        let long = s.duration > WILLPOWER_THRESHOLD_SECONDS;
        state = match state {
            SeekingFocus if focus && long => InFocus,
            InFocus if distraction && s.duration < WILLPOWER_THRESHOLD_SECONDS => Recovering,
            InFocus if distraction => SeekingFocus,
            Recovering if focus => {
                wins += 1;
                if long {
                    InFocus
                } else {
                    SeekingFocus
                }
            }
            Recovering if distraction => SeekingFocus,
            other => other,
        };
    }
    wins
}

/// Local hour with the most focus time. Ties go to the hour seen first.
pub fn peak_hour(sessions: &[Session], tz: UtcOffset) -> u8 {
    let mut buckets: Vec<(u8, i64)> = Vec::new();
    for s in sessions.iter().filter(|s| s.status.is_focus_like()) {
        let h = s.start.to_offset(tz).hour();
        match buckets.iter_mut().find(|(hour, _)| *hour == h) {
            Some((_, total)) => *total += s.duration,
            None => buckets.push((h, s.duration)),
        }
    }
    let mut best: Option<(u8, i64)> = None;
    for (h, total) in buckets {
        if best.map_or(true, |(_, b)| total > b) {
            best = Some((h, total));
        }
    }
    best.map(|(h, _)| h).unwrap_or(0)
}

/// Linear heuristic: 60 base, +5 per focused hour, +2 per willpower win, capped at 100.
pub fn efficiency_score(total_focus_seconds: i64, willpower_wins: i64) -> i64 {
    let hours = total_focus_seconds as f64 / 3600.0;
    let score = 60.0 + hours * 5.0 + willpower_wins as f64 * 2.0;
    (score as i64).min(100)
}

fn average(durations: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, n) = durations.fold((0i64, 0i64), |(sum, n), d| (sum + d, n + 1));
    (n > 0).then(|| sum as f64 / n as f64)
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

/// Average focus session length over average distraction session length.
pub fn fragmentation_ratio(sessions: &[Session]) -> f64 {
    let avg_focus = average(
        sessions
            .iter()
            .filter(|s| s.status.is_focus_like())
            .map(|s| s.duration),
    );
    let avg_distraction = average(
        sessions
            .iter()
            .filter(|s| s.status.is_distraction_like())
            .map(|s| s.duration),
    )
    .unwrap_or(0.0);

    match avg_focus {
        Some(f) if avg_distraction > 0.0 => round_to(f / avg_distraction, 2),
        Some(_) => FRAGMENTATION_NO_DISTRACTION,
        None => 0.0,
    }
}

/// Sessions per active hour, where the active span runs from the first to the last session start.
pub fn context_switch_freq(sessions: &[Session]) -> f64 {
    let (Some(first), Some(last)) = (sessions.first(), sessions.last()) else {
        return 0.0;
    };
    let active_hours = (last.start - first.start).whole_seconds() as f64 / 3600.0;
    if active_hours > MIN_ACTIVE_HOURS {
        round_to(sessions.len() as f64 / active_hours, 1)
    } else {
        0.0
    }
}

fn short_title(e: &CoreEvent) -> String {
    if e.clean_title.chars().count() > 8 || e.clean_title == "Unknown" {
        e.app_name.split('.').next().unwrap_or_default().to_string()
    } else {
        let t: String = e.clean_title.chars().take(6).collect();
        t.trim_end().to_string()
    }
}

/// Short label from the top core events, at most `SUMMARY_MAX_CHARS` characters.
pub fn daily_summary(core_events: &[CoreEvent], fallback: &str) -> String {
    let focus: Vec<&CoreEvent> = core_events
        .iter()
        .filter(|e| e.category == Category::Focus)
        .take(3)
        .collect();
    let entertainment = core_events
        .iter()
        .find(|e| e.category == Category::Entertainment);

    let mut items: Vec<String> = focus.iter().take(2).map(|e| short_title(e)).collect();
    if let Some(e) = entertainment.filter(|e| e.total_duration > 600) {
        items.push(format!("({})", short_title(e)));
    }
    if let Some(third) = focus.get(2) {
        if items.join(" ").chars().count() < 20 {
            items.push(short_title(third));
        }
    }
    items.retain(|t| !t.is_empty() && t != "()");

    let mut summary = items.join(" ");
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        summary.push('…');
    }
    if !summary.trim().is_empty() {
        return summary;
    }
    if !fallback.trim().is_empty() {
        return fallback.trim().to_string();
    }
    NO_ACTIVITY_SUMMARY.to_string()
}

/// Rule-based day label joined with " | ".
pub fn insight_tags(ratio: f64, switch_freq: f64, max_streak: i64, wins: i64, score: i64) -> String {
    let primary = if ratio > 1.2 && switch_freq < 10.0 {
        "deep flow"
    } else if ratio < 0.8 && switch_freq > 20.0 {
        "fragmented"
    } else if ratio > 1.0 && switch_freq > 15.0 {
        "high-pressure multitasking"
    } else {
        "steady work"
    };
    let mut tags = vec![primary];
    if max_streak > 90 * 60 {
        tags.push("iron man");
    }
    if wins > 8 {
        tags.push("willpower surge");
    }
    if score == 100 {
        tags.push("perfect day");
    }
    tags.join(" | ")
}

pub struct PeriodInput<'a> {
    pub date: Date,
    pub sessions: &'a [Session],
    pub daily: Option<&'a DailyAggregate>,
    pub core_events: &'a [CoreEvent],
    pub tz: UtcOffset,
    pub source: FocusTotalSource,
}

pub fn compute_period_stats(input: &PeriodInput<'_>) -> PeriodStats {
    let mut sessions = input.sessions.to_vec();
    sessions.sort_by_key(|s| s.start);

    let (total_focus, total_entertainment) = match (input.source, input.daily) {
        (FocusTotalSource::DailyAggregate, Some(d)) => {
            (d.total_focus_time, d.total_entertainment_time)
        }
        _ => (focus_total(&sessions), entertainment_total(&sessions)),
    };

    let max_streak = max_focus_streak(&sessions);
    let wins = willpower_wins(&sessions);
    let score = efficiency_score(total_focus, wins);
    let ratio = fragmentation_ratio(&sessions);
    let switch_freq = context_switch_freq(&sessions);
    let fallback = input.daily.map(|d| d.summary_text.as_str()).unwrap_or("");

    PeriodStats {
        date: input.date,
        total_focus,
        total_entertainment,
        max_streak,
        willpower_wins: wins,
        peak_hour: peak_hour(&sessions, input.tz),
        efficiency_score: score,
        daily_summary: daily_summary(input.core_events, fallback),
        focus_fragmentation_ratio: ratio,
        context_switch_freq: switch_freq,
        ai_insight: insight_tags(ratio, switch_freq, max_streak, wins, score),
    }
}

/// Computes and stores PeriodStats for `date` on an open transaction.
pub fn refresh_in(conn: &Connection, date: Date, settings: &Settings) -> CoreResult<PeriodStats> {
    let sessions = db::sessions::list_sessions_for_date(conn, date, settings.tz())?;
    let daily = db::daily::load_daily(conn, date)?;
    let core_events = db::core_events::list_core_events(conn, date)?;

    let stats = compute_period_stats(&PeriodInput {
        date,
        sessions: &sessions,
        daily: daily.as_ref(),
        core_events: &core_events,
        tz: settings.tz(),
        source: settings.focus_total_source,
    });

    // Cached streaks are not trusted; the fresh value replaces them.
    if daily.is_some() {
        db::daily::update_max_streak(conn, date, stats.max_streak)?;
    }
    db::period::replace_period_stats(conn, &stats)?;
    debug!(%date, total_focus = stats.total_focus, "period stats refreshed");
    Ok(stats)
}

pub fn refresh(conn: &mut Connection, date: Date, settings: &Settings) -> CoreResult<PeriodStats> {
    db::write_tx(conn, |tx| refresh_in(tx, date, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{parse_date, Status};
    use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

    fn base() -> OffsetDateTime {
        OffsetDateTime::parse("2026-02-15T09:00:00Z", &Rfc3339).unwrap()
    }

    fn s(status: Status, from_min: i64, to_min: i64) -> Session {
        let m = |mins: i64| base() + Duration::minutes(mins);
        Session::new(status, m(from_min), m(to_min), "", "").unwrap()
    }

    fn secs(status: Status, from_sec: i64, to_sec: i64) -> Session {
        let t = |x: i64| base() + Duration::seconds(x);
        Session::new(status, t(from_sec), t(to_sec), "", "").unwrap()
    }

    fn event(category: Category, rank: i64, app: &str, title: &str, dur: i64) -> CoreEvent {
        CoreEvent {
            date: parse_date("2026-02-15").unwrap(),
            category,
            rank,
            app_name: app.to_string(),
            clean_title: title.to_string(),
            total_duration: dur,
            event_count: 1,
        }
    }

    #[test]
    fn three_block_morning_scenario() {
        // 09:00-09:50 focus, 09:50-10:04 entertainment, 10:04-10:49 focus.
        let day = vec![
            s(Status::Focus, 0, 50),
            s(Status::Entertainment, 50, 64),
            s(Status::Focus, 64, 109),
        ];
        assert_eq!(max_focus_streak(&day), 50 * 60);
        assert_eq!(willpower_wins(&day), 0);
        assert_eq!(current_focus_streak(&day), 45 * 60);
        assert_eq!(peak_hour(&day, UtcOffset::UTC), 9);
    }

    #[test]
    fn single_short_session_scenario() {
        let day = vec![s(Status::Focus, 0, 3)];
        let stats = compute_period_stats(&PeriodInput {
            date: parse_date("2026-02-15").unwrap(),
            sessions: &day,
            daily: None,
            core_events: &[event(Category::Focus, 1, "notes.exe", "notes", 180)],
            tz: UtcOffset::UTC,
            source: FocusTotalSource::DailyAggregate,
        });
        assert_eq!(stats.total_focus, 180);
        assert_eq!(stats.efficiency_score, 60);
        assert_eq!(stats.peak_hour, 9);
        assert_eq!(stats.daily_summary, "notes");
        assert_eq!(stats.context_switch_freq, 0.0);
        assert_eq!(stats.focus_fragmentation_ratio, 10.0);
        assert_eq!(stats.max_streak, 180);
    }

    #[test]
    fn empty_day_is_all_defaults() {
        let stats = compute_period_stats(&PeriodInput {
            date: parse_date("2026-02-15").unwrap(),
            sessions: &[],
            daily: None,
            core_events: &[],
            tz: UtcOffset::UTC,
            source: FocusTotalSource::Sessions,
        });
        assert_eq!(stats.total_focus, 0);
        assert_eq!(stats.max_streak, 0);
        assert_eq!(stats.willpower_wins, 0);
        assert_eq!(stats.peak_hour, 0);
        assert_eq!(stats.efficiency_score, 60);
        assert_eq!(stats.focus_fragmentation_ratio, 0.0);
        assert_eq!(stats.context_switch_freq, 0.0);
        assert_eq!(stats.daily_summary, NO_ACTIVITY_SUMMARY);
        assert_eq!(stats.ai_insight, "steady work");
    }

    #[test]
    fn streak_merges_focus_within_two_minutes() {
        let day = vec![
            secs(Status::Focus, 0, 600),
            secs(Status::Work, 719, 1319),
            // 120 s gap is not "< 120", so this starts a new streak.
            secs(Status::Focus, 1439, 1500),
        ];
        assert_eq!(max_focus_streak(&day), 1200);
        assert_eq!(current_focus_streak(&day), 61);

        // A short distraction between focus blocks does not break the streak by itself.
        let day = vec![
            secs(Status::Focus, 0, 600),
            secs(Status::Entertainment, 600, 660),
            secs(Status::Focus, 660, 1260),
            secs(Status::Idle, 1260, 1300),
        ];
        assert_eq!(max_focus_streak(&day), 1200);
        assert_eq!(current_focus_streak(&day), 0);
    }

    #[test]
    fn streak_covers_longest_single_session() {
        let day = vec![
            s(Status::Focus, 0, 10),
            s(Status::Entertainment, 10, 40),
            s(Status::Work, 40, 130),
            s(Status::Other, 130, 140),
            s(Status::Focus, 140, 150),
        ];
        let longest = day
            .iter()
            .filter(|x| x.status.is_focus_like())
            .map(|x| x.duration)
            .max()
            .unwrap();
        assert!(max_focus_streak(&day) >= longest);
        assert!(max_focus_streak(&day) >= current_focus_streak(&day));
    }

    #[test]
    fn willpower_short_lapse_then_focus_is_a_win() {
        let day = vec![
            s(Status::Focus, 0, 30),
            secs(Status::Entertainment, 1800, 1920),
            s(Status::Focus, 32, 60),
        ];
        assert_eq!(willpower_wins(&day), 1);
    }

    #[test]
    fn willpower_double_lapse_and_long_lapse_do_not_count() {
        let double = vec![
            s(Status::Focus, 0, 30),
            s(Status::Entertainment, 30, 32),
            s(Status::Unknown, 32, 33),
            s(Status::Focus, 33, 60),
        ];
        assert_eq!(willpower_wins(&double), 0);

        let long = vec![
            s(Status::Focus, 0, 30),
            s(Status::Other, 30, 35),
            s(Status::Focus, 35, 60),
        ];
        assert_eq!(willpower_wins(&long), 0);
    }

    #[test]
    fn willpower_short_return_counts_but_resets() {
        let day = vec![
            s(Status::Focus, 0, 30),
            s(Status::Entertainment, 30, 31),
            // Win, but only 2 min of focus: back to seeking.
            s(Status::Focus, 31, 33),
            s(Status::Entertainment, 33, 34),
            s(Status::Focus, 34, 60),
        ];
        assert_eq!(willpower_wins(&day), 1);
    }

    #[test]
    fn willpower_idle_is_neutral() {
        let day = vec![
            s(Status::Focus, 0, 30),
            s(Status::Idle, 30, 90),
            s(Status::Entertainment, 90, 92),
            s(Status::Idle, 92, 93),
            s(Status::Work, 93, 120),
        ];
        assert_eq!(willpower_wins(&day), 1);
    }

    #[test]
    fn willpower_wins_bounded_by_short_distractions() {
        let day = vec![
            s(Status::Focus, 0, 10),
            s(Status::Entertainment, 10, 12),
            s(Status::Focus, 12, 20),
            s(Status::Other, 20, 21),
            s(Status::Work, 21, 40),
            s(Status::Unknown, 40, 41),
            s(Status::Focus, 41, 42),
            s(Status::Entertainment, 42, 43),
            s(Status::Focus, 43, 60),
        ];
        let short = day
            .iter()
            .filter(|x| x.status.is_distraction_like() && x.duration < WILLPOWER_THRESHOLD_SECONDS)
            .count() as i64;
        let wins = willpower_wins(&day);
        assert_eq!(wins, 3);
        assert!(wins <= short);
    }

    #[test]
    fn peak_hour_uses_local_offset_and_first_tie() {
        let day = vec![
            s(Status::Focus, 0, 30),
            s(Status::Entertainment, 30, 60),
            s(Status::Focus, 60, 90),
        ];
        // Equal totals at 09 and 10: the earlier bucket wins.
        assert_eq!(peak_hour(&day, UtcOffset::UTC), 9);
        assert_eq!(peak_hour(&day, UtcOffset::from_hms(8, 0, 0).unwrap()), 17);

        let day = vec![s(Status::Focus, 0, 10), s(Status::Work, 60, 100)];
        assert_eq!(peak_hour(&day, UtcOffset::UTC), 10);
        assert_eq!(peak_hour(&[s(Status::Entertainment, 0, 10)], UtcOffset::UTC), 0);
    }

    #[test]
    fn efficiency_score_is_truncated_and_capped() {
        assert_eq!(efficiency_score(0, 0), 60);
        assert_eq!(efficiency_score(180, 0), 60);
        assert_eq!(efficiency_score(3 * 3600, 2), 79);
        assert_eq!(efficiency_score(5400, 0), 67);
        assert_eq!(efficiency_score(10 * 3600, 10), 100);
    }

    #[test]
    fn fragmentation_ratio_edges() {
        assert_eq!(fragmentation_ratio(&[]), 0.0);
        assert_eq!(fragmentation_ratio(&[s(Status::Focus, 0, 10)]), 10.0);
        assert_eq!(fragmentation_ratio(&[s(Status::Entertainment, 0, 10)]), 0.0);

        let day = vec![
            s(Status::Focus, 0, 30),
            s(Status::Entertainment, 30, 40),
            s(Status::Focus, 40, 50),
            s(Status::Unknown, 50, 70),
        ];
        // avg focus 20 min, avg distraction 15 min.
        assert_eq!(fragmentation_ratio(&day), 1.33);
    }

    #[test]
    fn context_switch_freq_needs_half_an_hour() {
        let day = vec![s(Status::Focus, 0, 10), s(Status::Idle, 20, 25)];
        assert_eq!(context_switch_freq(&day), 0.0);

        let day = vec![
            s(Status::Focus, 0, 10),
            s(Status::Entertainment, 10, 20),
            s(Status::Focus, 20, 80),
            s(Status::Work, 90, 100),
        ];
        // 4 sessions over 1.5 h of active span.
        assert_eq!(context_switch_freq(&day), 2.7);
    }

    #[test]
    fn daily_summary_composition() {
        let events = vec![
            event(Category::Focus, 1, "code.exe", "lib.rs", 5000),
            event(Category::Focus, 2, "WINWORD.EXE", "Quarterly planning doc", 3000),
            event(Category::Focus, 3, "notes.exe", "todo", 1000),
            event(Category::Entertainment, 1, "video.exe", "Unknown", 900),
            event(Category::Entertainment, 2, "game.exe", "chess", 700),
        ];
        // 22 chars already: no room for the third focus item.
        assert_eq!(daily_summary(&events, ""), "lib.rs WINWORD (video)");

        // Short entertainment is left out.
        let mut quiet = events.clone();
        quiet[3].total_duration = 600;
        assert_eq!(daily_summary(&quiet, ""), "lib.rs WINWORD todo");
    }

    #[test]
    fn daily_summary_truncates_and_falls_back() {
        let events = vec![
            event(Category::Focus, 1, "averyveryverylongapplication.exe", "long enough title", 5000),
            event(Category::Focus, 2, "anotherlongapplicationname.exe", "long enough title", 4000),
        ];
        let out = daily_summary(&events, "");
        assert_eq!(out.chars().count(), SUMMARY_MAX_CHARS);
        assert!(out.ends_with('…'));

        assert_eq!(daily_summary(&[], "wrote the report"), "wrote the report");
        assert_eq!(daily_summary(&[], "  "), NO_ACTIVITY_SUMMARY);
    }

    #[test]
    fn insight_tags_rules() {
        assert_eq!(insight_tags(2.0, 5.0, 0, 0, 70), "deep flow");
        assert_eq!(insight_tags(0.5, 25.0, 0, 0, 70), "fragmented");
        assert_eq!(insight_tags(1.1, 16.0, 0, 0, 70), "high-pressure multitasking");
        assert_eq!(
            insight_tags(1.0, 12.0, 100 * 60, 9, 100),
            "steady work | iron man | willpower surge | perfect day"
        );
    }

    #[test]
    fn total_source_policy_is_explicit() {
        let date = parse_date("2026-02-15").unwrap();
        let day = vec![s(Status::Focus, 0, 60), s(Status::Entertainment, 60, 70)];
        let mut daily = DailyAggregate::empty(date);
        daily.total_focus_time = 7200;
        daily.total_entertainment_time = 60;

        let with = |source| {
            compute_period_stats(&PeriodInput {
                date,
                sessions: &day,
                daily: Some(&daily),
                core_events: &[],
                tz: UtcOffset::UTC,
                source,
            })
        };
        let from_daily = with(FocusTotalSource::DailyAggregate);
        assert_eq!((from_daily.total_focus, from_daily.total_entertainment), (7200, 60));
        assert_eq!(from_daily.efficiency_score, 70);

        let from_sessions = with(FocusTotalSource::Sessions);
        assert_eq!((from_sessions.total_focus, from_sessions.total_entertainment), (3600, 600));
        assert_eq!(from_sessions.efficiency_score, 65);
    }
}
