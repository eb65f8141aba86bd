use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;
use time::Date;
use tracing::info;

use crate::config::Settings;
use crate::db::{self, sessions::SessionFilter};
use crate::error::CoreResult;
use crate::model::{day_window, local_date, Status};
use crate::pipeline::{recompute_day_in, DayReport};

/// Process-name keywords that always mean work.
pub const WORK_APPS: &[&str] = &[
    "Feishu", "Lark", "DingTalk", "WeChatWork",
    "Teams", "Zoom", "Meeting", "TencentMeeting", "wemeetapp",
    "Trae", "Code", "PyCharm", "idea64", "studio", "sublime", "notepad++",
    "Word", "Excel", "PowerPoint", "WPS",
];

#[derive(Clone, Debug, Serialize)]
pub struct ReclassifyOutcome {
    pub updated: usize,
    pub days: Vec<DayReport>,
}

fn rewrite_in(
    conn: &Connection,
    start: Date,
    end: Date,
    filter: &SessionFilter,
    new_status: Status,
    settings: &Settings,
    affected: &mut BTreeSet<Date>,
) -> CoreResult<usize> {
    let tz = settings.tz();
    let (from, _) = day_window(start, tz);
    let (_, to) = day_window(end, tz);
    let touched = db::sessions::update_status_between(conn, from, to, filter, new_status)?;
    affected.extend(touched.iter().map(|t| local_date(*t, tz)));
    Ok(touched.len())
}

fn recompute_affected_in(
    conn: &Connection,
    affected: &BTreeSet<Date>,
    settings: &Settings,
) -> CoreResult<Vec<DayReport>> {
    affected
        .iter()
        .map(|d| recompute_day_in(conn, *d, settings))
        .collect()
}

/// Bulk status rewrite over `[start, end]`, followed by a full recompute of every
/// date that changed. Both happen in one transaction.
pub fn reclassify(
    conn: &mut Connection,
    start: Date,
    end: Date,
    filter: &SessionFilter,
    new_status: Status,
    settings: &Settings,
) -> CoreResult<ReclassifyOutcome> {
    let outcome = db::write_tx(conn, |tx| {
        let mut affected = BTreeSet::new();
        let updated = rewrite_in(tx, start, end, filter, new_status, settings, &mut affected)?;
        let days = recompute_affected_in(tx, &affected, settings)?;
        Ok(ReclassifyOutcome { updated, days })
    })?;
    info!(
        updated = outcome.updated,
        dates = outcome.days.len(),
        to = new_status.as_str(),
        "sessions reclassified"
    );
    Ok(outcome)
}

/// Rewrites sessions of known work applications that were labelled as distraction.
pub fn fix_misclassified(
    conn: &mut Connection,
    start: Date,
    end: Date,
    settings: &Settings,
) -> CoreResult<ReclassifyOutcome> {
    let outcome = db::write_tx(conn, |tx| {
        let mut affected = BTreeSet::new();
        let mut updated = 0;
        for app in WORK_APPS {
            let filter = SessionFilter {
                process_contains: Some(app.to_string()),
                title_contains: None,
                from_statuses: vec![Status::Entertainment, Status::Unknown, Status::Other],
            };
            let n = rewrite_in(tx, start, end, &filter, Status::Work, settings, &mut affected)?;
            if n > 0 {
                info!(app, sessions = n, "reclassified to work");
            }
            updated += n;
        }
        let days = recompute_affected_in(tx, &affected, settings)?;
        Ok(ReclassifyOutcome { updated, days })
    })?;
    info!(updated = outcome.updated, dates = outcome.days.len(), "misclassification fix done");
    Ok(outcome)
}
