use std::collections::BTreeMap;

use rusqlite::Connection;
use time::Date;
use tracing::debug;

use crate::config::Settings;
use crate::db;
use crate::error::CoreResult;
use crate::model::{Category, CoreEvent, Session};

const TITLE_MAX_CHARS: usize = 15;
const TITLE_KEEP_CHARS: usize = 12;

/// Process basename, e.g. `C:\Program Files\Code\Code.exe` -> `Code.exe`.
pub fn app_name(process_name: &str) -> String {
    let name = process_name.trim();
    name.rsplit(['\\', '/']).next().unwrap_or(name).to_string()
}

fn strip_exe(name: &str) -> &str {
    let n = name.len();
    if n > 4 && name.is_char_boundary(n - 4) && name[n - 4..].eq_ignore_ascii_case(".exe") {
        &name[..n - 4]
    } else {
        name
    }
}

/// Display title for a session: summary, else the leading part of the window
/// title, else the bare process name.
pub fn clean_title(session: &Session) -> String {
    if let Some(summary) = session.summary.as_deref().map(str::trim) {
        if summary.chars().count() > 2 {
            return summary.to_string();
        }
    }

    let head = session.window_title.split(" - ").next().unwrap_or("").trim();
    if !head.is_empty() {
        if head.chars().count() > TITLE_MAX_CHARS {
            let mut t: String = head.chars().take(TITLE_KEEP_CHARS).collect();
            t.push_str("...");
            return t;
        }
        return head.to_string();
    }

    let app = app_name(&session.process_name);
    let bare = strip_exe(&app);
    if bare.is_empty() {
        "Unknown".to_string()
    } else {
        bare.to_string()
    }
}

/// Top-`top_k` `(app, clean_title)` groups per category, ranked by total duration.
pub fn extract(date: Date, sessions: &[Session], top_k: usize) -> Vec<CoreEvent> {
    let mut groups: BTreeMap<(Category, String, String), (i64, i64)> = BTreeMap::new();
    for s in sessions {
        let Some(category) = Category::of_status(s.status) else {
            continue;
        };
        let entry = groups
            .entry((category, app_name(&s.process_name), clean_title(s)))
            .or_insert((0, 0));
        entry.0 += s.duration;
        entry.1 += 1;
    }

    let mut out = Vec::new();
    for category in [Category::Focus, Category::Entertainment] {
        let mut items: Vec<(&String, &String, i64, i64)> = groups
            .iter()
            .filter(|((c, _, _), _)| *c == category)
            .map(|((_, app, title), (dur, count))| (app, title, *dur, *count))
            .collect();
        // Stable: equal durations keep (app, title) key order.
        items.sort_by(|a, b| b.2.cmp(&a.2));
        items.truncate(top_k);

        out.extend(items.into_iter().enumerate().map(|(i, (app, title, dur, count))| CoreEvent {
            date,
            category,
            rank: i as i64 + 1,
            app_name: app.clone(),
            clean_title: title.clone(),
            total_duration: dur,
            event_count: count,
        }));
    }
    out
}

/// Re-extracts and replaces all core events for `date` on an open transaction.
pub fn refresh_in(conn: &Connection, date: Date, settings: &Settings) -> CoreResult<Vec<CoreEvent>> {
    let sessions = db::sessions::list_sessions_for_date(conn, date, settings.tz())?;
    let events = extract(date, &sessions, settings.top_k.max(1) as usize);
    db::core_events::replace_core_events(conn, date, &events)?;
    debug!(%date, count = events.len(), "core events refreshed");
    Ok(events)
}

pub fn refresh(conn: &mut Connection, date: Date, settings: &Settings) -> CoreResult<Vec<CoreEvent>> {
    db::write_tx(conn, |tx| refresh_in(tx, date, settings))
}
