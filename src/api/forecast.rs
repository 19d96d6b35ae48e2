use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{bad_request, not_found};
use super::state::AppState;
use crate::bus_cache::day_type_for_date;
use crate::topology;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ForecastQuery {
    pub target_date: String,
    pub direction: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HourlyForecast {
    pub hour: i64,
    pub predicted_value: Option<f64>,
    pub occupancy_pct: Option<i64>,
    pub crowd_level: String,
    pub max_capacity: i64,
    pub in_service: bool,
}

#[utoipa::path(
    get,
    path = "/forecast/{line_name}",
    params(
        ("line_name" = String, Path, description = "Line code as used in the request"),
        ("target_date" = String, Query, description = "YYYY-MM-DD"),
        ("direction" = Option<String>, Query, description = "G or D, bus lines only"),
    ),
    responses(
        (status = 200, description = "24 hourly forecast records", body = [HourlyForecast]),
        (status = 400, description = "target_date beyond the 7-day horizon"),
        (status = 404, description = "line unknown or no forecasts stored"),
    ),
    tag = "forecast"
)]
pub async fn get_forecast(
    State(state): State<AppState>,
    Path(line_name): Path<String>,
    Query(query): Query<ForecastQuery>,
) -> Response {
    let target_date = match NaiveDate::parse_from_str(&query.target_date, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => return bad_request("target_date must be YYYY-MM-DD").into_response(),
    };

    let today = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
    if target_date > today + chrono::Duration::days(7) {
        return bad_request("target_date may not be more than 7 days in the future").into_response();
    }

    if state.store.line(&line_name).await.unwrap_or(None).is_none() {
        return not_found(format!("unknown line {line_name}")).into_response();
    }

    let resolved_line_name = topology::resolve_forecast_alias(&line_name);
    let rows = match state.store.forecasts_for(resolved_line_name, target_date).await {
        Ok(rows) => rows,
        Err(_) => return not_found("no forecasts stored for this line/date").into_response(),
    };
    if rows.is_empty() {
        return not_found("no forecasts stored for this line/date").into_response();
    }

    let (first_hour, last_hour) = match service_window(&state, &line_name, query.direction.as_deref()).await {
        Some(window) => window,
        None => (0, 23),
    };
    let service_hours = service_hours_set(first_hour, last_hour);

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let in_service = service_hours.contains(&(row.hour as u32));
        out.push(HourlyForecast {
            hour: row.hour,
            predicted_value: if in_service { Some(row.predicted_value) } else { None },
            occupancy_pct: if in_service { Some(row.occupancy_pct) } else { None },
            crowd_level: if in_service { row.crowd_level } else { "Out of Service".to_string() },
            max_capacity: row.max_capacity,
            in_service,
        });
    }

    Json(out).into_response()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/{line_name}", get(get_forecast))
}

/// Builds the (first_hour, last_hour) service window for the requested
/// line/direction. Returns `None` when no schedule information is available,
/// in which case the caller treats every hour as in-service.
async fn service_window(state: &AppState, line_code: &str, direction: Option<&str>) -> Option<(u32, u32)> {
    if topology::is_marmaray(line_code) {
        return Some((parse_hour(topology::MARMARAY_FIRST_TIME)?, parse_hour(topology::MARMARAY_LAST_TIME)?));
    }

    if topology::is_rail_code(line_code) {
        let topology = state.topology.read().await.clone();
        let directions = &topology.line(line_code)?.directions;
        let first = directions.first()?;
        let last = directions.last()?;
        return Some((parse_hour(&first.first_time)?, parse_hour(&last.last_time)?));
    }

    let today = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
    let day_type = day_type_for_date(today);
    let row = state.store.bus_cache_exact(line_code, today, day_type).await.ok()??;
    let payload: serde_json::Value = serde_json::from_str(&row.payload).ok()?;

    let directions: Vec<&str> = match direction {
        Some("G") => vec!["G"],
        Some("D") => vec!["D"],
        _ => vec!["G", "D"],
    };

    let mut hours = Vec::new();
    for dir in directions {
        if let Some(times) = payload.get(dir).and_then(|v| v.as_array()) {
            for time in times {
                if let Some(time_str) = time.as_str() {
                    if let Some(hour) = parse_hour(time_str) {
                        hours.push(hour);
                    }
                }
            }
        }
    }

    if hours.is_empty() {
        return None;
    }
    Some((*hours.iter().min().unwrap(), *hours.iter().max().unwrap()))
}

fn parse_hour(time_str: &str) -> Option<u32> {
    time_str.get(0..2)?.parse().ok()
}

/// Walks forward from `first_hour` to `last_hour`, wrapping past midnight
/// when `last_hour < first_hour`. A non-wrapping window additionally gets a
/// one-hour buffer past its close (the last bus dispatched at `last_hour`
/// is still mid-trip for the following hour). A wrapping window already
/// reaches midnight under its own service hours, so no buffer is added —
/// the hours immediately after midnight stay out of service.
fn service_hours_set(first_hour: u32, last_hour: u32) -> HashSet<u32> {
    let first_hour = first_hour % 24;
    let last_hour = last_hour % 24;
    let wraps = last_hour < first_hour;

    let mut set = HashSet::new();
    let mut hour = first_hour;
    loop {
        set.insert(hour);
        if hour == last_hour {
            break;
        }
        hour = (hour + 1) % 24;
    }
    if !wraps {
        set.insert((last_hour + 1) % 24);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_hours_handles_midnight_wrap() {
        let hours = service_hours_set(6, 0);
        assert!(hours.contains(&6));
        assert!(hours.contains(&23));
        assert!(hours.contains(&0));
        assert!(!hours.contains(&1));
        assert!(!hours.contains(&3));
        assert!(!hours.contains(&5));
    }

    #[test]
    fn service_hours_non_wrapping() {
        let hours = service_hours_set(7, 22);
        assert!(hours.contains(&7));
        assert!(hours.contains(&22));
        assert!(hours.contains(&23));
        assert!(!hours.contains(&6));
        assert!(!hours.contains(&0));
    }
}
