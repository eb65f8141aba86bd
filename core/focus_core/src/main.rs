use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use time::{Date, OffsetDateTime};
use tracing::info;

use focus_core::aggregator::consolidate;
use focus_core::config::{self, FocusTotalSource, Settings};
use focus_core::db::{self, sessions::SessionFilter};
use focus_core::model::{local_date, parse_date, Status};
use focus_core::{daily, maintenance, pipeline, report, server};

#[derive(Parser, Debug)]
#[command(name = "focus_core", version)]
struct Args {
    /// SQLite database path.
    #[arg(long, global = true, default_value = "./data/focus-core.db")]
    db: PathBuf,

    /// Local timezone as minutes east of UTC. Stored; later runs reuse it.
    #[arg(long, global = true, allow_hyphen_values = true)]
    tz_offset_minutes: Option<i32>,

    /// Longest silence (seconds) that still continues a session.
    #[arg(long, global = true)]
    max_gap_seconds: Option<i64>,

    /// Core events kept per category.
    #[arg(long, global = true)]
    top_k: Option<i64>,

    /// Where period stats read the day's focus total from.
    #[arg(long, global = true, value_parser = parse_source)]
    focus_total_source: Option<FocusTotalSource>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve {
        /// Listen address.
        ///
        /// Accepts:
        /// - ip:port (recommended), e.g. 127.0.0.1:17700
        /// - ip (implies port 17700), e.g. 127.0.0.1
        /// - localhost[:port]
        #[arg(long, default_value = "127.0.0.1:17700")]
        listen: String,
    },
    /// Feed JSON-lines observations (from a file or stdin) through the aggregator.
    Ingest {
        #[arg(long)]
        input: Option<PathBuf>,
        /// Skip recomputing the touched dates afterwards.
        #[arg(long)]
        no_recompute: bool,
    },
    /// Rebuild daily aggregates, core events and period stats.
    Recompute {
        #[arg(long, conflicts_with_all = ["start", "days"])]
        date: Option<String>,
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
        /// The last N days, ending today.
        #[arg(long, conflicts_with = "start")]
        days: Option<u32>,
    },
    /// Compare stored totals with session sums and repair drift.
    Check {
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
        /// Override the stored tolerance (seconds).
        #[arg(long)]
        tolerance_seconds: Option<i64>,
    },
    /// Rewrite the status of matching sessions and recompute affected days.
    Reclassify {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Case-insensitive substring of the process name.
        #[arg(long)]
        process: Option<String>,
        /// Case-insensitive substring of the window title.
        #[arg(long)]
        title: Option<String>,
        /// Only sessions currently in these statuses (repeatable).
        #[arg(long = "from")]
        from: Vec<String>,
        #[arg(long)]
        to: String,
    },
    /// Move known work applications out of entertainment/unknown/other.
    FixMisclassified {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Print the consolidated timeline of a day.
    Timeline {
        #[arg(long)]
        date: Option<String>,
    },
    /// Export one day as markdown or CSV.
    Export {
        #[arg(long)]
        date: Option<String>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Markdown)]
        format: ExportFormat,
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Summarize a date range.
    Report {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Markdown,
    Csv,
}

fn parse_source(raw: &str) -> Result<FocusTotalSource, String> {
    FocusTotalSource::parse(raw)
        .ok_or_else(|| format!("expected 'daily_aggregate' or 'sessions', got '{raw}'"))
}

/// Stored settings win unless a flag was given explicitly; explicit flags are persisted.
fn resolve_settings(conn: &Connection, args: &Args) -> anyhow::Result<Settings> {
    let stored = config::load_or_init_settings(conn, Settings::default())?;
    let mut next = stored;
    if let Some(v) = args.tz_offset_minutes {
        next.tz_offset_minutes = v;
    }
    if let Some(v) = args.max_gap_seconds {
        next.max_gap_seconds = v;
    }
    if let Some(v) = args.top_k {
        next.top_k = v;
    }
    if let Some(v) = args.focus_total_source {
        next.focus_total_source = v;
    }
    let next = next.clamped();
    if next != stored {
        config::upsert_app_settings(conn, next)?;
        info!(
            tz_offset_minutes = next.tz_offset_minutes,
            max_gap_seconds = next.max_gap_seconds,
            top_k = next.top_k,
            source = next.focus_total_source.as_str(),
            "settings updated"
        );
    }
    Ok(next)
}

fn date_or_today(raw: Option<&str>, settings: &Settings) -> anyhow::Result<Date> {
    Ok(match raw {
        Some(d) => parse_date(d)?,
        None => local_date(OffsetDateTime::now_utc(), settings.tz()),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ingest(
    conn: &mut Connection,
    settings: &Settings,
    input: Option<PathBuf>,
    recompute: bool,
) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut agg = pipeline::resume_aggregator(conn, settings)?;
    let summary = pipeline::ingest_lines(conn, &mut agg, reader, settings)?;
    info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        dates = summary.dates.len(),
        "ingest done"
    );

    if recompute {
        for date in &summary.dates {
            pipeline::recompute_day(conn, *date, settings)?;
        }
    }
    println!(
        "accepted {}, rejected {}, dates touched {}",
        summary.accepted,
        summary.rejected,
        summary.dates.len()
    );
    Ok(())
}

fn print_outcome(label: &str, outcome: &maintenance::ReclassifyOutcome) {
    println!("{label}: {} sessions updated", outcome.updated);
    for day in &outcome.days {
        println!(
            "  {}  focus {}  score {}  {}",
            day.date,
            report::fmt_duration(day.daily.total_focus_time),
            day.period.efficiency_score,
            day.period.daily_summary
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "focus_core=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut conn = db::open(&args.db)
        .with_context(|| format!("failed to open database {}", args.db.display()))?;
    let settings = resolve_settings(&conn, &args)?;
    info!("DB: {}", args.db.display());

    match args.command {
        Command::Serve { listen } => {
            let addr = server::parse_listen(&listen)?;
            server::serve(server::AppState::new(conn, settings)?, addr).await?;
        }
        Command::Ingest {
            input,
            no_recompute,
        } => ingest(&mut conn, &settings, input, !no_recompute)?,
        Command::Recompute {
            date,
            start,
            end,
            days,
        } => {
            let reports = match (start, end, days) {
                (Some(s), Some(e), _) => {
                    pipeline::recompute_range(&mut conn, parse_date(&s)?, parse_date(&e)?, &settings)?
                }
                (_, _, Some(n)) => pipeline::backfill(&mut conn, n, &settings)?,
                _ => {
                    let date = date_or_today(date.as_deref(), &settings)?;
                    vec![pipeline::recompute_day(&mut conn, date, &settings)?]
                }
            };
            for r in &reports {
                println!(
                    "{}  focus {}  streak {}  wins {}  score {}  {}",
                    r.date,
                    report::fmt_duration(r.period.total_focus),
                    report::fmt_duration(r.period.max_streak),
                    r.period.willpower_wins,
                    r.period.efficiency_score,
                    r.period.daily_summary
                );
            }
        }
        Command::Check {
            start,
            end,
            tolerance_seconds,
        } => {
            let range = match (start, end) {
                (Some(s), Some(e)) => Some((parse_date(&s)?, parse_date(&e)?)),
                _ => None,
            };
            let tolerance = tolerance_seconds.unwrap_or(settings.discrepancy_tolerance_seconds);
            let found = daily::check(&mut conn, settings.tz(), tolerance, range)?;
            if found.is_empty() {
                println!("all daily aggregates consistent");
            } else {
                print_json(&found)?;
            }
        }
        Command::Reclassify {
            start,
            end,
            process,
            title,
            from,
            to,
        } => {
            let filter = SessionFilter {
                process_contains: process,
                title_contains: title,
                from_statuses: from
                    .iter()
                    .map(|s| Status::parse(s))
                    .collect::<Result<Vec<_>, _>>()?,
            };
            let outcome = maintenance::reclassify(
                &mut conn,
                parse_date(&start)?,
                parse_date(&end)?,
                &filter,
                Status::parse(&to)?,
                &settings,
            )?;
            print_outcome("reclassify", &outcome);
        }
        Command::FixMisclassified { start, end } => {
            let outcome = maintenance::fix_misclassified(
                &mut conn,
                parse_date(&start)?,
                parse_date(&end)?,
                &settings,
            )?;
            print_outcome("fix-misclassified", &outcome);
        }
        Command::Timeline { date } => {
            let date = date_or_today(date.as_deref(), &settings)?;
            let sessions = db::sessions::list_sessions_for_date(&conn, date, settings.tz())?;
            for seg in consolidate(&sessions, settings.display_gap_seconds, settings.tz()) {
                println!(
                    "{}-{}  {:<13} {}m",
                    seg.start_label,
                    seg.end_label,
                    seg.status.as_str(),
                    seg.display_minutes
                );
            }
        }
        Command::Export { date, format, out } => {
            let date = date_or_today(date.as_deref(), &settings)?;
            let day = match pipeline::load_day(&conn, date)? {
                Some(d) => d,
                None => pipeline::recompute_day(&mut conn, date, &settings)?,
            };
            let body = match format {
                ExportFormat::Markdown => {
                    let sessions = db::sessions::list_sessions_for_date(&conn, date, settings.tz())?;
                    let timeline = consolidate(&sessions, settings.display_gap_seconds, settings.tz());
                    report::export_markdown(&day, &timeline)
                }
                ExportFormat::Csv => report::export_csv(&day),
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!("wrote {}", path.display());
                }
                None => std::io::stdout().write_all(body.as_bytes())?,
            }
        }
        Command::Report { start, end, json } => {
            let summary = report::range_summary(&conn, parse_date(&start)?, parse_date(&end)?, settings.tz())?;
            if json {
                print_json(&summary)?;
            } else {
                print!("{}", report::range_markdown(&summary));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "focus_core",
            "--tz-offset-minutes",
            "-300",
            "reclassify",
            "--start",
            "2026-02-01",
            "--end",
            "2026-02-02",
            "--process",
            "chat",
            "--from",
            "entertainment",
            "--from",
            "other",
            "--to",
            "work",
        ])
        .unwrap();
        assert_eq!(args.tz_offset_minutes, Some(-300));
        match args.command {
            Command::Reclassify { from, to, .. } => {
                assert_eq!(from, ["entertainment", "other"]);
                assert_eq!(to, "work");
            }
            other => panic!("unexpected {other:?}"),
        }

        let args = Args::try_parse_from(["focus_core", "export", "--format", "csv"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Export { format: ExportFormat::Csv, .. }
        ));
        assert!(Args::try_parse_from(["focus_core", "recompute", "--start", "2026-02-01"]).is_err());
    }

    #[test]
    fn explicit_flags_override_and_persist() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&mut conn).unwrap();

        let args = Args::try_parse_from(["focus_core", "--top-k", "3", "timeline"]).unwrap();
        let s = resolve_settings(&conn, &args).unwrap();
        assert_eq!(s.top_k, 3);

        let args = Args::try_parse_from(["focus_core", "timeline"]).unwrap();
        let s = resolve_settings(&conn, &args).unwrap();
        assert_eq!(s.top_k, 3);
        assert_eq!(s.max_gap_seconds, config::DEFAULT_MAX_GAP_SECONDS);
    }
}
