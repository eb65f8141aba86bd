use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::aggregator::{consolidate, Observation, SessionAggregator};
use crate::config::Settings;
use crate::daily;
use crate::db;
use crate::db::sessions::SessionFilter;
use crate::error::{CoreError, CoreResult};
use crate::maintenance;
use crate::model::{local_date, parse_date, Status};
use crate::pipeline;
use crate::report;

pub const DEFAULT_PORT: u16 = 17700;

#[derive(Clone)]
pub struct AppState {
    pub conn: Arc<Mutex<Connection>>,
    pub settings: Arc<Mutex<Settings>>,
    pub aggregator: Arc<Mutex<SessionAggregator>>,
}

impl AppState {
    /// The aggregator resumes after the sessions already stored in `conn`.
    pub fn new(conn: Connection, settings: Settings) -> CoreResult<Self> {
        let aggregator = pipeline::resume_aggregator(&conn, &settings)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            aggregator: Arc::new(Mutex::new(aggregator)),
            settings: Arc::new(Mutex::new(settings)),
        })
    }
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err_response(e: CoreError) -> Response {
    let status = if e.is_validation() {
        warn!("rejected request: {e}");
        StatusCode::BAD_REQUEST
    } else {
        error!("request failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: e.code(),
            detail: Some(e.to_string()),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(r: CoreResult<T>) -> Response {
    match r {
        Ok(v) => ok(v),
        Err(e) => err_response(e),
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/observation", post(post_observation).options(options_ok))
        .route("/flush", post(post_flush).options(options_ok))
        .route("/daily", get(get_daily))
        .route("/stats", get(get_stats))
        .route("/core_events", get(get_core_events))
        .route("/timeline", get(get_timeline))
        .route("/recompute", post(post_recompute).options(options_ok))
        .route("/reclassify", post(post_reclassify).options(options_ok))
        .route("/check", post(post_check).options(options_ok))
        .route("/export/markdown", get(get_export_markdown))
        .route("/export/csv", get(get_export_csv))
        .route("/report", get(get_report))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state.clone());
    info!("Core listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Do not drop the open run on shutdown.
    let settings = *state.settings.lock().await;
    let mut agg = state.aggregator.lock().await;
    let mut conn = state.conn.lock().await;
    if let Some(s) = pipeline::flush_aggregator(&mut conn, &mut agg, &settings)? {
        info!(status = s.status.as_str(), duration = s.duration, "flushed open session on shutdown");
    }
    Ok(())
}

pub fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "focus_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

#[derive(Deserialize)]
struct DateQuery {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
}

fn resolve_date(raw: Option<&str>, settings: &Settings) -> CoreResult<Date> {
    match raw {
        Some(d) => parse_date(d),
        None => Ok(local_date(OffsetDateTime::now_utc(), settings.tz())),
    }
}

#[derive(Serialize)]
struct ObservationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    closed: Option<crate::model::Session>,
}

async fn post_observation(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let obs: Observation = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(e) => return err_response(e.into()),
    };
    let settings = *state.settings.lock().await;
    let mut agg = state.aggregator.lock().await;
    let mut conn = state.conn.lock().await;
    respond(
        pipeline::ingest_observation(&mut conn, &mut agg, &obs, &settings)
            .map(|closed| ObservationResult { closed }),
    )
}

async fn post_flush(State(state): State<AppState>) -> Response {
    let settings = *state.settings.lock().await;
    let mut agg = state.aggregator.lock().await;
    let mut conn = state.conn.lock().await;
    respond(
        pipeline::flush_aggregator(&mut conn, &mut agg, &settings)
            .map(|closed| ObservationResult { closed }),
    )
}

async fn get_daily(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    let settings = *state.settings.lock().await;
    let conn = state.conn.lock().await;
    respond(resolve_date(q.date.as_deref(), &settings).and_then(|date| {
        Ok(db::daily::load_daily(&conn, date)?
            .unwrap_or_else(|| crate::model::DailyAggregate::empty(date)))
    }))
}

/// Stored day view; computed on first request for a date.
async fn day_report(state: &AppState, raw: Option<&str>) -> CoreResult<pipeline::DayReport> {
    let settings = *state.settings.lock().await;
    let date = resolve_date(raw, &settings)?;
    let mut conn = state.conn.lock().await;
    match pipeline::load_day(&conn, date)? {
        Some(r) => Ok(r),
        None => pipeline::recompute_day(&mut conn, date, &settings),
    }
}

async fn get_stats(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    respond(day_report(&state, q.date.as_deref()).await.map(|r| r.period))
}

async fn get_core_events(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    respond(day_report(&state, q.date.as_deref()).await.map(|r| r.core_events))
}

async fn get_timeline(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    let settings = *state.settings.lock().await;
    let conn = state.conn.lock().await;
    respond(resolve_date(q.date.as_deref(), &settings).and_then(|date| {
        let sessions = db::sessions::list_sessions_for_date(&conn, date, settings.tz())?;
        Ok(consolidate(&sessions, settings.display_gap_seconds, settings.tz()))
    }))
}

#[derive(Deserialize)]
struct RecomputeRequest {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

async fn post_recompute(State(state): State<AppState>, Json(req): Json<RecomputeRequest>) -> Response {
    let settings = *state.settings.lock().await;
    let mut conn = state.conn.lock().await;
    let mut run = || -> CoreResult<Vec<pipeline::DayReport>> {
        match (req.start.as_deref(), req.end.as_deref()) {
            (Some(s), Some(e)) => {
                pipeline::recompute_range(&mut conn, parse_date(s)?, parse_date(e)?, &settings)
            }
            _ => {
                let date = resolve_date(req.date.as_deref(), &settings)?;
                Ok(vec![pipeline::recompute_day(&mut conn, date, &settings)?])
            }
        }
    };
    respond(run())
}

#[derive(Deserialize)]
struct ReclassifyRequest {
    start: String,
    end: String,
    new_status: String,
    #[serde(flatten)]
    filter: SessionFilter,
}

async fn post_reclassify(State(state): State<AppState>, Json(req): Json<ReclassifyRequest>) -> Response {
    let settings = *state.settings.lock().await;
    let mut conn = state.conn.lock().await;
    let mut run = || -> CoreResult<maintenance::ReclassifyOutcome> {
        let start = parse_date(&req.start)?;
        let end = parse_date(&req.end)?;
        let to = Status::parse(&req.new_status)?;
        maintenance::reclassify(&mut conn, start, end, &req.filter, to, &settings)
    };
    respond(run())
}

#[derive(Deserialize, Default)]
struct CheckRequest {
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

async fn post_check(State(state): State<AppState>, body: Option<Json<CheckRequest>>) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let settings = *state.settings.lock().await;
    let mut conn = state.conn.lock().await;
    let mut run = || -> CoreResult<Vec<daily::Discrepancy>> {
        let range = match (req.start.as_deref(), req.end.as_deref()) {
            (Some(s), Some(e)) => Some((parse_date(s)?, parse_date(e)?)),
            _ => None,
        };
        daily::check(
            &mut conn,
            settings.tz(),
            settings.discrepancy_tolerance_seconds,
            range,
        )
    };
    respond(run())
}

fn text(content_type: &'static str, body: String) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn get_export_markdown(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    let report = match day_report(&state, q.date.as_deref()).await {
        Ok(r) => r,
        Err(e) => return err_response(e),
    };
    let settings = *state.settings.lock().await;
    let conn = state.conn.lock().await;
    let sessions = match db::sessions::list_sessions_for_date(&conn, report.date, settings.tz()) {
        Ok(v) => v,
        Err(e) => return err_response(e.into()),
    };
    let timeline = consolidate(&sessions, settings.display_gap_seconds, settings.tz());
    text(
        "text/markdown; charset=utf-8",
        report::export_markdown(&report, &timeline),
    )
}

async fn get_export_csv(State(state): State<AppState>, Query(q): Query<DateQuery>) -> Response {
    match day_report(&state, q.date.as_deref()).await {
        Ok(r) => text("text/csv; charset=utf-8", report::export_csv(&r)),
        Err(e) => err_response(e),
    }
}

async fn get_report(State(state): State<AppState>, Query(q): Query<RangeQuery>) -> Response {
    let settings = *state.settings.lock().await;
    let conn = state.conn.lock().await;
    respond(
        parse_date(&q.start)
            .and_then(|start| Ok((start, parse_date(&q.end)?)))
            .and_then(|(start, end)| report::range_summary(&conn, start, end, settings.tz())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_works() {
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_listen("0.0.0.0").unwrap().port(), DEFAULT_PORT);
        assert_eq!(parse_listen("localhost:8123").unwrap().port(), 8123);
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert!(parse_listen("localhost:x").is_err());
        assert!(parse_listen("example.com").is_err());
    }

    #[test]
    fn validation_errors_map_to_bad_request() {
        let resp = err_response(CoreError::UnknownStatus("napping".to_string()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = err_response(CoreError::Storage(rusqlite::Error::InvalidQuery));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn observation_flow_through_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focus.db");
        let state = AppState::new(db::open(&path).unwrap(), Settings::default()).unwrap();

        for (status, ts) in [("focus", 1_771_146_000.0), ("entertainment", 1_771_146_060.0)] {
            let body = serde_json::json!({ "status": status, "timestamp": ts, "process_name": "a.exe" });
            let resp = post_observation(State(state.clone()), Json(body)).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let bad = serde_json::json!({ "status": "napping", "timestamp": 1_771_146_120.0 });
        let resp = post_observation(State(state.clone()), Json(bad)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = post_flush(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let count = |conn: &Connection| -> i64 {
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count(&*state.conn.lock().await), 2);

        // A restarted server refuses to replay what is already stored.
        let restarted = AppState::new(db::open(&path).unwrap(), Settings::default()).unwrap();
        let replay = serde_json::json!({ "status": "focus", "timestamp": 1_771_146_000.0 });
        let resp = post_observation(State(restarted.clone()), Json(replay)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let fresh = serde_json::json!({ "status": "focus", "timestamp": 1_771_146_300.0 });
        let resp = post_observation(State(restarted.clone()), Json(fresh)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = post_flush(State(restarted.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(count(&*restarted.conn.lock().await), 3);
    }
}
