use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{internal_error, not_found};
use super::state::AppState;
use crate::bus_cache::day_type_for_date;
use crate::capacity::CapacityMeta;

#[derive(Debug, Serialize, ToSchema)]
pub struct LineResponse {
    pub line_name: String,
    pub transport_type_id: i64,
    pub road_type: Option<String>,
    pub line: Option<String>,
    pub capacity: CapacityMeta,
}

#[utoipa::path(
    get,
    path = "/lines/{line_name}",
    params(("line_name" = String, Path, description = "Line code")),
    responses(
        (status = 200, description = "Line metadata", body = LineResponse),
        (status = 404, description = "Line unknown"),
    ),
    tag = "lines"
)]
pub async fn get_line(State(state): State<AppState>, Path(line_name): Path<String>) -> Response {
    match state.store.line(&line_name).await {
        Ok(Some(row)) => {
            let capacity = state.capacity_store.read().await.get(&row.line_name);
            Json(LineResponse {
                line_name: row.line_name,
                transport_type_id: row.transport_type_id,
                road_type: row.road_type,
                line: row.line,
                capacity,
            })
            .into_response()
        }
        Ok(None) => not_found(format!("unknown line {line_name}")).into_response(),
        Err(err) => internal_error::<crate::db::Error>("lines.get_line")(err),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchQuery {
    pub query: String,
}

#[utoipa::path(
    get,
    path = "/lines/search",
    params(("query" = String, Query, description = "Search term")),
    responses((status = 200, description = "Top 15 candidates", body = [LineResponse])),
    tag = "lines"
)]
pub async fn search_lines(State(state): State<AppState>, Query(params): Query<SearchQuery>) -> Response {
    match state.store.search_lines(&params.query, 15).await {
        Ok(rows) => {
            let capacity_store = state.capacity_store.read().await.clone();
            Json(
                rows.into_iter()
                    .map(|row| {
                        let capacity = capacity_store.get(&row.line_name);
                        LineResponse {
                            line_name: row.line_name,
                            transport_type_id: row.transport_type_id,
                            road_type: row.road_type,
                            line: row.line,
                            capacity,
                        }
                    })
                    .collect::<Vec<_>>(),
            )
            .into_response()
        }
        Err(err) => internal_error::<crate::db::Error>("lines.search_lines")(err),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScheduleResponse {
    #[serde(rename = "G")]
    pub g: Vec<String>,
    #[serde(rename = "D")]
    pub d: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/lines/{line_code}/schedule",
    params(("line_code" = String, Path, description = "Bus line code")),
    responses(
        (status = 200, description = "Today's schedule", body = ScheduleResponse),
        (status = 404, description = "No schedule data"),
        (status = 500, description = "Upstream hard-failed"),
    ),
    tag = "lines"
)]
pub async fn get_schedule(State(state): State<AppState>, Path(line_code): Path<String>) -> Response {
    let today = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
    let (payload, _is_stale, _fetched_live) = state
        .bus_cache
        .get_or_fetch(&line_code, today, state.config.retention.schedule_cache_days)
        .await;

    let Some(payload) = payload else {
        return not_found("no schedule data available for this line").into_response();
    };

    let g: Vec<String> = payload
        .get("G")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let d: Vec<String> = payload
        .get("D")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    if g.is_empty() && d.is_empty() {
        let day_type = day_type_for_date(today);
        if payload.get("day_type").and_then(|v| v.as_str()) != Some(day_type) {
            return not_found("no schedule data available for this line").into_response();
        }
    }

    Json(ScheduleResponse { g, d }).into_response()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", get(search_lines))
        .route("/{line_name}", get(get_line))
        .route("/{line_code}/schedule", get(get_schedule))
}
