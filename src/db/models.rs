//! Row types mirrored 1:1 onto the tables created by `migrations/0001_init.sql`.

use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct TransportLineRow {
    pub line_name: String,
    pub transport_type_id: i64,
    pub road_type: Option<String>,
    pub line: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct DailyForecastRow {
    pub line_name: String,
    pub date: String,
    pub hour: i64,
    pub predicted_value: f64,
    pub occupancy_pct: i64,
    pub crowd_level: String,
    pub max_capacity: i64,
    pub trips_per_hour: Option<i64>,
    pub vehicle_capacity: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct JobExecutionRow {
    pub id: i64,
    pub job_type: String,
    pub target_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub job_metadata: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct BusScheduleCacheRow {
    pub id: i64,
    pub line_code: String,
    pub valid_for: String,
    pub day_type: String,
    pub payload: String,
    pub fetched_at: String,
    pub source_status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct MetroScheduleCacheRow {
    pub id: i64,
    pub station_id: String,
    pub direction_id: String,
    pub line_code: Option<String>,
    pub station_name: Option<String>,
    pub direction_name: Option<String>,
    pub valid_for: String,
    pub payload: String,
    pub fetched_at: String,
    pub source_status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct UserReportRow {
    pub id: i64,
    pub report_type: String,
    pub line_code: Option<String>,
    pub description: String,
    pub contact_email: Option<String>,
    pub status: String,
    pub created_at: String,
}
