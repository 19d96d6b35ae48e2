use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::auth::AdminAuth;
use super::error::{bad_request, internal_error};
use super::state::AppState;
use crate::db::models::JobExecutionRow;
use crate::feature_store::types::FallbackStats;

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobsQuery {
    pub limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/admin/jobs",
    params(("limit" = Option<i64>, Query, description = "defaults to 20")),
    responses((status = 200, description = "Recent job executions, newest first", body = [JobExecutionRow])),
    tag = "admin"
)]
pub async fn list_jobs(_auth: AdminAuth, State(state): State<AppState>, Query(query): Query<JobsQuery>) -> Response {
    match state.store.recent_jobs(query.limit.unwrap_or(20)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => internal_error::<crate::db::Error>("admin.list_jobs")(err),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminStats {
    pub total_forecast_rows: i64,
    pub distinct_lines: i64,
    pub last_successful_runs: Vec<JobExecutionRow>,
}

#[utoipa::path(
    get,
    path = "/admin/stats",
    responses((status = 200, description = "Dashboard summary", body = AdminStats)),
    tag = "admin"
)]
pub async fn get_stats(_auth: AdminAuth, State(state): State<AppState>) -> Response {
    let total_forecast_rows = match state.store.total_forecast_row_count().await {
        Ok(v) => v,
        Err(err) => return internal_error::<crate::db::Error>("admin.get_stats")(err),
    };
    let distinct_lines = match state.store.distinct_forecast_line_count().await {
        Ok(v) => v,
        Err(err) => return internal_error::<crate::db::Error>("admin.get_stats")(err),
    };

    let mut last_successful_runs = Vec::new();
    for job_type in ["daily_forecast", "bus_schedule_prefetch", "metro_schedule_prefetch", "retention_cleanup"] {
        if let Ok(Some(row)) = state.store.last_success_by_job_type(job_type).await {
            last_successful_runs.push(row);
        }
    }

    Json(AdminStats {
        total_forecast_rows,
        distinct_lines,
        last_successful_runs,
    })
    .into_response()
}

#[utoipa::path(
    get,
    path = "/admin/feature-store/stats",
    responses((status = 200, description = "Fallback tier distribution", body = FallbackStats)),
    tag = "admin"
)]
pub async fn feature_store_stats(_auth: AdminAuth, State(state): State<AppState>) -> Json<FallbackStats> {
    let feature_store = state.feature_store.read().await.clone();
    Json(feature_store.fallback_stats())
}

#[utoipa::path(
    post,
    path = "/admin/feature-store/reset-stats",
    responses((status = 200, description = "Counters reset")),
    tag = "admin"
)]
pub async fn feature_store_reset_stats(_auth: AdminAuth, State(state): State<AppState>) -> Json<serde_json::Value> {
    let feature_store = state.feature_store.read().await.clone();
    feature_store.reset_fallback_stats();
    Json(serde_json::json!({ "reset": true }))
}

#[utoipa::path(
    post,
    path = "/admin/scheduler/pause",
    responses((status = 200, description = "All jobs paused")),
    tag = "admin"
)]
pub async fn pause_scheduler(_auth: AdminAuth, State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scheduler.pause();
    Json(serde_json::json!({ "paused": true }))
}

#[utoipa::path(
    post,
    path = "/admin/scheduler/resume",
    responses((status = 200, description = "All jobs resumed")),
    tag = "admin"
)]
pub async fn resume_scheduler(_auth: AdminAuth, State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scheduler.resume();
    Json(serde_json::json!({ "paused": false }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CleanupTriggerRequest {
    pub days_to_keep: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/admin/scheduler/trigger/cleanup",
    request_body = CleanupTriggerRequest,
    responses((status = 200, description = "Retention sweep enqueued")),
    tag = "admin"
)]
pub async fn trigger_cleanup(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<CleanupTriggerRequest>,
) -> Response {
    let days_to_keep = request.days_to_keep.unwrap_or(3);
    let store = state.store.clone();
    let result = state
        .scheduler
        .add_oneshot("forecast_cleanup_manual", move || async move {
            let today = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
            let cutoff = today - chrono::Duration::days(days_to_keep);
            match store.cleanup_forecasts(cutoff).await {
                Ok(deleted) => tracing::info!(deleted, "manual retention sweep complete"),
                Err(err) => tracing::error!(error = %err, "manual retention sweep failed"),
            }
        })
        .await;

    match result {
        Ok(()) => Json(serde_json::json!({ "enqueued": true })).into_response(),
        Err(err) => internal_error::<crate::scheduler::Error>("admin.trigger_cleanup")(err),
    }
}

#[utoipa::path(
    delete,
    path = "/admin/forecasts/date/{target_date}",
    params(("target_date" = String, Path, description = "YYYY-MM-DD")),
    responses(
        (status = 200, description = "Rows deleted"),
        (status = 400, description = "Malformed date"),
    ),
    tag = "admin"
)]
pub async fn delete_forecasts_for_date(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(target_date): Path<String>,
) -> Response {
    let date = match NaiveDate::parse_from_str(&target_date, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => return bad_request("target_date must be YYYY-MM-DD").into_response(),
    };
    match state.store.delete_forecasts_for_date(date).await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(err) => internal_error::<crate::db::Error>("admin.delete_forecasts_for_date")(err),
    }
}

#[utoipa::path(
    get,
    path = "/admin/scheduler/status",
    responses((status = 200, description = "Per-job run/failure counters and next firing time", body = [crate::scheduler::JobStatus])),
    tag = "admin"
)]
pub async fn scheduler_status(_auth: AdminAuth, State(state): State<AppState>) -> Json<Vec<crate::scheduler::JobStatus>> {
    Json(state.scheduler.status().await)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TriggerForecastRequest {
    pub target_date: Option<String>,
}

#[utoipa::path(
    post,
    path = "/admin/scheduler/trigger/forecast",
    request_body = TriggerForecastRequest,
    responses(
        (status = 200, description = "Forecast run enqueued"),
        (status = 400, description = "Malformed target_date"),
    ),
    tag = "admin"
)]
pub async fn trigger_forecast(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<TriggerForecastRequest>,
) -> Response {
    let target_date = match request.target_date.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => return bad_request("target_date must be YYYY-MM-DD").into_response(),
        },
        None => crate::bus_cache::today_in(chrono_tz::Europe::Istanbul),
    };

    let store = state.store.clone();
    let feature_store = state.feature_store.clone();
    let model = state.model.clone();
    let weather_config = state.config.weather.clone();
    let horizon_days = state.config.schedule.forecast_horizon_days;

    let result = state
        .scheduler
        .add_oneshot("daily_forecast_manual", move || async move {
            if let Err(err) =
                crate::run_daily_forecast(store, feature_store, model, weather_config, target_date, horizon_days).await
            {
                tracing::error!(error = %err, "manual forecast trigger failed");
            }
        })
        .await;

    match result {
        Ok(()) => Json(serde_json::json!({ "enqueued": true, "target_date": target_date.to_string() })).into_response(),
        Err(err) => internal_error::<crate::scheduler::Error>("admin.trigger_forecast")(err),
    }
}

#[utoipa::path(
    post,
    path = "/admin/jobs/reset",
    responses((status = 200, description = "Stuck RUNNING job executions reset to FAILED")),
    tag = "admin"
)]
pub async fn reset_stuck_jobs(_auth: AdminAuth, State(state): State<AppState>) -> Response {
    match state.store.sweep_stuck_jobs().await {
        Ok(reset) => Json(serde_json::json!({ "reset": reset })).into_response(),
        Err(err) => internal_error::<crate::db::Error>("admin.reset_stuck_jobs")(err),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CoverageDay {
    pub date: String,
    pub row_count: i64,
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/admin/forecasts/coverage",
    responses((status = 200, description = "Per-day forecast coverage", body = [CoverageDay])),
    tag = "admin"
)]
pub async fn forecast_coverage(_auth: AdminAuth, State(state): State<AppState>) -> Response {
    let today = crate::bus_cache::today_in(chrono_tz::Europe::Istanbul);
    let line_count = match state.store.all_line_names().await {
        Ok(names) => names.len() as i64,
        Err(err) => return internal_error::<crate::db::Error>("admin.forecast_coverage")(err),
    };
    let expected_per_day = line_count * 24;

    let mut out = Vec::new();
    for offset in -7..=7i64 {
        let date = today + chrono::Duration::days(offset);
        let row_count = match state.store.forecast_row_count_for_date(date).await {
            Ok(v) => v,
            Err(err) => return internal_error::<crate::db::Error>("admin.forecast_coverage")(err),
        };
        let status = if row_count == 0 {
            "missing"
        } else if expected_per_day > 0 && row_count >= expected_per_day {
            "complete"
        } else {
            "partial"
        };
        out.push(CoverageDay {
            date: date.to_string(),
            row_count,
            status: status.to_string(),
        });
    }

    Json(out).into_response()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/stats", get(get_stats))
        .route("/feature-store/stats", get(feature_store_stats))
        .route("/feature-store/reset-stats", post(feature_store_reset_stats))
        .route("/scheduler/pause", post(pause_scheduler))
        .route("/scheduler/resume", post(resume_scheduler))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/trigger/cleanup", post(trigger_cleanup))
        .route("/scheduler/trigger/forecast", post(trigger_forecast))
        .route("/jobs/reset", post(reset_stuck_jobs))
        .route("/forecasts/date/{target_date}", delete(delete_forecasts_for_date))
        .route("/forecasts/coverage", get(forecast_coverage))
}
