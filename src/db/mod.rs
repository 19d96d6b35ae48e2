//! Persistent Store: transactional SQLite access with upsert-on-conflict as the
//! sole write primitive. One short-lived transaction per logical unit (a
//! forecast batch, a job-status transition, a schedule-payload store).

pub mod models;

use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use models::{
    BusScheduleCacheRow, DailyForecastRow, JobExecutionRow, MetroScheduleCacheRow,
    TransportLineRow, UserReportRow,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The "marker" message the startup sweep and `/admin/jobs/reset` both write
/// into a stuck RUNNING row before transitioning it to FAILED.
pub const STUCK_JOB_MARKER: &str = "Job reset - was stuck in RUNNING state";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- TransportLine -------------------------------------------------

    pub async fn seed_lines_if_empty(
        &self,
        lines: &[(String, i64, Option<String>, Option<String>)],
    ) -> Result<(), Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transport_lines")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (line_name, transport_type_id, road_type, line) in lines {
            sqlx::query(
                "INSERT INTO transport_lines (line_name, transport_type_id, road_type, line)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(line_name) DO NOTHING",
            )
            .bind(line_name)
            .bind(transport_type_id)
            .bind(road_type)
            .bind(line)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = lines.len(), "seeded transport_lines from static file");
        Ok(())
    }

    pub async fn line(&self, line_name: &str) -> Result<Option<TransportLineRow>, Error> {
        let row = sqlx::query_as::<_, TransportLineRow>(
            "SELECT line_name, transport_type_id, road_type, line FROM transport_lines WHERE line_name = ?",
        )
        .bind(line_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn all_line_names(&self) -> Result<Vec<String>, Error> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT line_name FROM transport_lines")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn bus_line_codes(&self) -> Result<Vec<String>, Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT line_name FROM transport_lines WHERE transport_type_id = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn search_lines(&self, query: &str, limit: i64) -> Result<Vec<TransportLineRow>, Error> {
        let pattern = format!("%{}%", query);
        let compact_pattern = format!("%{}%", query.replace(' ', ""));
        let rows = sqlx::query_as::<_, TransportLineRow>(
            r#"
            SELECT line_name, transport_type_id, road_type, line,
                CASE
                    WHEN lower(line_name) = lower(?1) THEN 1
                    WHEN lower(replace(line_name, ' ', '')) = lower(replace(?1, ' ', '')) THEN 2
                    WHEN lower(line_name) LIKE lower(?1 || '%') THEN 3
                    WHEN lower(replace(line_name, ' ', '')) LIKE lower(replace(?1, ' ', '') || '%') THEN 4
                    WHEN lower(line_name) LIKE lower(?2) THEN 5
                    ELSE 6
                END AS relevance
            FROM transport_lines
            WHERE lower(line_name) LIKE lower(?2)
               OR lower(coalesce(line, '')) LIKE lower(?2)
               OR lower(replace(line_name, ' ', '')) LIKE lower(?3)
            ORDER BY relevance ASC, line_name ASC
            LIMIT ?4
            "#,
        )
        .bind(query)
        .bind(&pattern)
        .bind(&compact_pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- JobExecution ----------------------------------------------------

    pub async fn start_job(
        &self,
        job_type: &str,
        target_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        metadata: Value,
    ) -> Result<i64, Error> {
        let result = sqlx::query(
            "INSERT INTO job_executions (job_type, target_date, end_date, status, job_metadata)
             VALUES (?, ?, ?, 'RUNNING', ?)",
        )
        .bind(job_type)
        .bind(target_date.map(|d| d.to_string()))
        .bind(end_date.map(|d| d.to_string()))
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_job_success(&self, id: i64, records_processed: i64) -> Result<(), Error> {
        sqlx::query(
            "UPDATE job_executions
             SET status = 'SUCCESS', end_time = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), records_processed = ?
             WHERE id = ?",
        )
        .bind(records_processed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_job_failed(&self, id: i64, error: &str) -> Result<(), Error> {
        let truncated: String = error.chars().take(1000).collect();
        sqlx::query(
            "UPDATE job_executions
             SET status = 'FAILED', end_time = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), error_message = ?
             WHERE id = ?",
        )
        .bind(truncated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transitions any RUNNING JobExecution rows left behind by a prior crash
    /// to FAILED. Run once at startup and available to administrators via
    /// `POST /admin/jobs/reset`.
    pub async fn sweep_stuck_jobs(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE job_executions
             SET status = 'FAILED', end_time = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), error_message = ?
             WHERE status = 'RUNNING'",
        )
        .bind(STUCK_JOB_MARKER)
        .execute(&self.pool)
        .await?;
        let affected = result.rows_affected();
        if affected > 0 {
            warn!(count = affected, "swept stuck RUNNING job executions");
        }
        Ok(affected)
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<JobExecutionRow>, Error> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT id, job_type, target_date, end_date, status, start_time, end_time,
                    records_processed, error_message, job_metadata
             FROM job_executions ORDER BY start_time DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn last_success_by_job_type(&self, job_type: &str) -> Result<Option<JobExecutionRow>, Error> {
        let row = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT id, job_type, target_date, end_date, status, start_time, end_time,
                    records_processed, error_message, job_metadata
             FROM job_executions WHERE job_type = ? AND status = 'SUCCESS'
             ORDER BY start_time DESC LIMIT 1",
        )
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ---- DailyForecast -----------------------------------------------------

    pub async fn upsert_forecasts(&self, rows: &[DailyForecastRow]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO daily_forecasts
                    (line_name, date, hour, predicted_value, occupancy_pct, crowd_level, max_capacity)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(line_name, date, hour) DO UPDATE SET
                    predicted_value = excluded.predicted_value,
                    occupancy_pct = excluded.occupancy_pct,
                    crowd_level = excluded.crowd_level,
                    max_capacity = excluded.max_capacity
                "#,
            )
            .bind(&row.line_name)
            .bind(&row.date)
            .bind(row.hour)
            .bind(row.predicted_value)
            .bind(row.occupancy_pct)
            .bind(&row.crowd_level)
            .bind(row.max_capacity)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn forecasts_for(&self, line_name: &str, date: NaiveDate) -> Result<Vec<DailyForecastRow>, Error> {
        let rows = sqlx::query_as::<_, DailyForecastRow>(
            "SELECT line_name, date, hour, predicted_value, occupancy_pct, crowd_level,
                    max_capacity, trips_per_hour, vehicle_capacity
             FROM daily_forecasts WHERE line_name = ? AND date = ? ORDER BY hour ASC",
        )
        .bind(line_name)
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn forecast_row_count_for_date(&self, date: NaiveDate) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_forecasts WHERE date = ?")
            .bind(date.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_forecasts_for_date(&self, date: NaiveDate) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM daily_forecasts WHERE date = ?")
            .bind(date.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn cleanup_forecasts(&self, cutoff: NaiveDate) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM daily_forecasts WHERE date < ?")
            .bind(cutoff.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn distinct_forecast_line_count(&self) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT line_name) FROM daily_forecasts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn total_forecast_row_count(&self) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_forecasts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ---- BusScheduleCache ---------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_bus_cache(
        &self,
        line_code: &str,
        valid_for: NaiveDate,
        day_type: &str,
        payload: &Value,
        source_status: &str,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO bus_schedule_cache (line_code, valid_for, day_type, payload, source_status, error_message, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(line_code, valid_for, day_type) DO UPDATE SET
                payload = excluded.payload,
                source_status = excluded.source_status,
                error_message = excluded.error_message,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(line_code)
        .bind(valid_for.to_string())
        .bind(day_type)
        .bind(payload.to_string())
        .bind(source_status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn bus_cache_exact(
        &self,
        line_code: &str,
        valid_for: NaiveDate,
        day_type: &str,
    ) -> Result<Option<BusScheduleCacheRow>, Error> {
        let row = sqlx::query_as::<_, BusScheduleCacheRow>(
            "SELECT id, line_code, valid_for, day_type, payload, fetched_at, source_status, error_message
             FROM bus_schedule_cache
             WHERE line_code = ? AND valid_for = ? AND day_type = ? AND source_status = 'SUCCESS'",
        )
        .bind(line_code)
        .bind(valid_for.to_string())
        .bind(day_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn bus_cache_latest_stale(
        &self,
        line_code: &str,
        day_type: &str,
        max_valid_for: NaiveDate,
    ) -> Result<Option<BusScheduleCacheRow>, Error> {
        let row = sqlx::query_as::<_, BusScheduleCacheRow>(
            "SELECT id, line_code, valid_for, day_type, payload, fetched_at, source_status, error_message
             FROM bus_schedule_cache
             WHERE line_code = ? AND day_type = ? AND valid_for <= ? AND source_status = 'SUCCESS'
             ORDER BY valid_for DESC LIMIT 1",
        )
        .bind(line_code)
        .bind(day_type)
        .bind(max_valid_for.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn cleanup_bus_cache(&self, cutoff: NaiveDate) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM bus_schedule_cache WHERE valid_for < ?")
            .bind(cutoff.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- MetroScheduleCache --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_metro_cache(
        &self,
        station_id: &str,
        direction_id: &str,
        line_code: Option<&str>,
        station_name: Option<&str>,
        direction_name: Option<&str>,
        valid_for: NaiveDate,
        payload: &Value,
        source_status: &str,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO metro_schedule_cache
                (station_id, direction_id, line_code, station_name, direction_name, valid_for, payload, source_status, error_message, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(station_id, direction_id, valid_for) DO UPDATE SET
                line_code = COALESCE(excluded.line_code, metro_schedule_cache.line_code),
                station_name = COALESCE(excluded.station_name, metro_schedule_cache.station_name),
                direction_name = COALESCE(excluded.direction_name, metro_schedule_cache.direction_name),
                payload = excluded.payload,
                source_status = excluded.source_status,
                error_message = excluded.error_message,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(station_id)
        .bind(direction_id)
        .bind(line_code)
        .bind(station_name)
        .bind(direction_name)
        .bind(valid_for.to_string())
        .bind(payload.to_string())
        .bind(source_status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn metro_cache_exact(
        &self,
        station_id: &str,
        direction_id: &str,
        valid_for: NaiveDate,
    ) -> Result<Option<MetroScheduleCacheRow>, Error> {
        let row = sqlx::query_as::<_, MetroScheduleCacheRow>(
            "SELECT id, station_id, direction_id, line_code, station_name, direction_name,
                    valid_for, payload, fetched_at, source_status, error_message
             FROM metro_schedule_cache
             WHERE station_id = ? AND direction_id = ? AND valid_for = ? AND source_status = 'SUCCESS'",
        )
        .bind(station_id)
        .bind(direction_id)
        .bind(valid_for.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn metro_cache_latest_stale(
        &self,
        station_id: &str,
        direction_id: &str,
        max_valid_for: NaiveDate,
    ) -> Result<Option<MetroScheduleCacheRow>, Error> {
        let row = sqlx::query_as::<_, MetroScheduleCacheRow>(
            "SELECT id, station_id, direction_id, line_code, station_name, direction_name,
                    valid_for, payload, fetched_at, source_status, error_message
             FROM metro_schedule_cache
             WHERE station_id = ? AND direction_id = ? AND valid_for <= ? AND source_status = 'SUCCESS'
             ORDER BY valid_for DESC LIMIT 1",
        )
        .bind(station_id)
        .bind(direction_id)
        .bind(max_valid_for.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn metro_cache_by_line(
        &self,
        line_code: &str,
        valid_for: NaiveDate,
    ) -> Result<Vec<MetroScheduleCacheRow>, Error> {
        let rows = sqlx::query_as::<_, MetroScheduleCacheRow>(
            "SELECT id, station_id, direction_id, line_code, station_name, direction_name,
                    valid_for, payload, fetched_at, source_status, error_message
             FROM metro_schedule_cache
             WHERE line_code = ? AND valid_for = ? AND source_status = 'SUCCESS'",
        )
        .bind(line_code)
        .bind(valid_for.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn cleanup_metro_cache(&self, cutoff: NaiveDate) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM metro_schedule_cache WHERE valid_for < ?")
            .bind(cutoff.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- UserReport --------------------------------------------------------

    pub async fn create_report(
        &self,
        report_type: &str,
        line_code: Option<&str>,
        description: &str,
        contact_email: Option<&str>,
    ) -> Result<i64, Error> {
        let result = sqlx::query(
            "INSERT INTO user_reports (report_type, line_code, description, contact_email)
             VALUES (?, ?, ?, ?)",
        )
        .bind(report_type)
        .bind(line_code)
        .bind(description)
        .bind(contact_email)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_reports(&self, status: Option<&str>) -> Result<Vec<UserReportRow>, Error> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, UserReportRow>(
                    "SELECT id, report_type, line_code, description, contact_email, status, created_at
                     FROM user_reports WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UserReportRow>(
                    "SELECT id, report_type, line_code, description, contact_email, status, created_at
                     FROM user_reports ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}
