use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{bad_request, gateway_timeout, not_found};
use super::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct MetroScheduleRequest {
    pub boarding_station_id: String,
    pub direction_id: String,
    pub date_time: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MetroScheduleResponse {
    pub times: Vec<String>,
    pub has_service_today: bool,
    pub data_status: String,
    pub valid_for: String,
}

#[utoipa::path(
    post,
    path = "/metro/schedule",
    request_body = MetroScheduleRequest,
    responses(
        (status = 200, description = "Cached timetable payload", body = MetroScheduleResponse),
        (status = 404, description = "Unknown station/direction pair"),
        (status = 504, description = "Total upstream failure with no cached fallback"),
    ),
    tag = "metro"
)]
pub async fn get_schedule(
    State(state): State<AppState>,
    Json(request): Json<MetroScheduleRequest>,
) -> Response {
    let valid_for = match request.date_time.as_deref() {
        Some(dt) => match NaiveDate::parse_from_str(&dt[..10.min(dt.len())], "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => return bad_request("date_time must start with YYYY-MM-DD").into_response(),
        },
        None => crate::bus_cache::today_in(chrono_tz::Europe::Istanbul),
    };

    let (payload, _is_stale, _fetched_live) = state
        .metro_cache
        .get_or_fetch(&request.boarding_station_id, &request.direction_id, None, valid_for, 2)
        .await;

    let Some(payload) = payload else {
        return gateway_timeout("metro upstream unavailable and no cached fallback exists").into_response();
    };

    let times = crate::metro_cache::extract_times(&payload);
    let success = payload.get("Success").and_then(|v| v.as_bool()).unwrap_or(false);
    let data_status = if !success {
        "NO_DATA"
    } else if times.is_empty() {
        "NO_SERVICE_DAY"
    } else {
        "OK"
    };

    Json(MetroScheduleResponse {
        has_service_today: success && !times.is_empty(),
        times,
        data_status: data_status.to_string(),
        valid_for: valid_for.to_string(),
    })
    .into_response()
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MetroDurationResponse {
    pub minutes: i64,
}

/// Proxy for inter-station travel duration. A thin estimate derived from the
/// cached timetable's observed interval, TTL'd the same as the schedule
/// cache itself; no separate upstream call is made.
#[utoipa::path(
    post,
    path = "/metro/duration",
    request_body = MetroScheduleRequest,
    responses(
        (status = 200, description = "Per-station travel minutes", body = MetroDurationResponse),
        (status = 404, description = "Unknown station/direction pair"),
    ),
    tag = "metro"
)]
pub async fn get_duration(
    State(state): State<AppState>,
    Json(request): Json<MetroScheduleRequest>,
) -> Response {
    let valid_for = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
    let (payload, _is_stale, _fetched_live) = state
        .metro_cache
        .get_or_fetch(&request.boarding_station_id, &request.direction_id, None, valid_for, 2)
        .await;

    let Some(payload) = payload else {
        return not_found("unknown station/direction pair").into_response();
    };

    let times = crate::metro_cache::extract_times(&payload);
    let times: Vec<&str> = times.iter().map(String::as_str).collect();

    let minutes = average_interval_minutes(&times).unwrap_or(5);
    Json(MetroDurationResponse { minutes }).into_response()
}

fn average_interval_minutes(times: &[&str]) -> Option<i64> {
    if times.len() < 2 {
        return None;
    }
    let mut total = 0i64;
    let mut count = 0i64;
    for pair in times.windows(2) {
        let a = parse_minutes(pair[0])?;
        let b = parse_minutes(pair[1])?;
        let diff = (b - a).rem_euclid(24 * 60);
        total += diff;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(total / count)
    }
}

fn parse_minutes(time_str: &str) -> Option<i64> {
    let (h, m) = time_str.split_once(':')?;
    Some(h.parse::<i64>().ok()? * 60 + m.parse::<i64>().ok()?)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schedule", post(get_schedule))
        .route("/duration", post(get_duration))
}
