use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use super::error::{bad_request, internal_error};
use super::state::AppState;
use crate::db::models::UserReportRow;

const VALID_REPORT_TYPES: &[&str] = &["Bug", "Data", "Feature"];

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateReportRequest {
    pub report_type: String,
    pub line_code: Option<String>,
    pub description: String,
    pub contact_email: Option<String>,
}

#[utoipa::path(
    post,
    path = "/reports",
    request_body = CreateReportRequest,
    responses(
        (status = 200, description = "Report created", body = UserReportRow),
        (status = 400, description = "Unknown report_type"),
    ),
    tag = "reports"
)]
pub async fn create_report(
    State(state): State<AppState>,
    Json(request): Json<CreateReportRequest>,
) -> Response {
    if !VALID_REPORT_TYPES.contains(&request.report_type.as_str()) {
        return bad_request(format!(
            "report_type must be one of {:?}",
            VALID_REPORT_TYPES
        ))
        .into_response();
    }

    let id = match state
        .store
        .create_report(
            &request.report_type,
            request.line_code.as_deref(),
            &request.description,
            request.contact_email.as_deref(),
        )
        .await
    {
        Ok(id) => id,
        Err(err) => return internal_error::<crate::db::Error>("reports.create_report")(err),
    };

    Json(serde_json::json!({ "id": id, "status": "new" })).into_response()
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReportsQuery {
    pub status: Option<String>,
}

#[utoipa::path(
    get,
    path = "/reports",
    params(("status" = Option<String>, Query, description = "Optional status filter")),
    responses((status = 200, description = "User reports", body = [UserReportRow])),
    tag = "reports"
)]
pub async fn list_reports(State(state): State<AppState>, Query(query): Query<ReportsQuery>) -> Response {
    match state.store.list_reports(query.status.as_deref()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => internal_error::<crate::db::Error>("reports.list_reports")(err),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_reports).post(create_report))
}
