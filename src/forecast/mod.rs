//! Forecast Engine: the nightly batch job. Enumerates transport lines,
//! assembles one model-input row per (line, hour) for each requested day,
//! scores the whole batch in one call, and bulk-upserts the results.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::db::models::DailyForecastRow;
use crate::db::Store;
use crate::feature_store::FeatureStore;
use crate::model::types::ModelInput;
use crate::model::Model;
use crate::weather::WeatherClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] crate::db::Error),
    #[error("No calendar features for date {0}")]
    CalendarMissing(String),
}

/// Owns a snapshot of the swappable stores rather than the `Arc<RwLock<_>>`
/// the API layer holds them behind — a fresh engine is built from the
/// current snapshot each time the nightly job fires, so an in-flight run is
/// never disturbed by a hot-reload swapping the underlying `Arc`.
pub struct ForecastEngine {
    store: Store,
    feature_store: Arc<FeatureStore>,
    model: Arc<Model>,
    weather: WeatherClient,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub days_processed: i64,
    pub records_processed: i64,
}

impl ForecastEngine {
    pub fn new(store: Store, feature_store: Arc<FeatureStore>, model: Arc<Model>, weather: WeatherClient) -> Self {
        Self {
            store,
            feature_store,
            model,
            weather,
        }
    }

    /// Runs the batch forecast for `num_days` consecutive days starting at
    /// `target_date`. A single JobExecution row tracks the whole span; any
    /// day's failure aborts the run and transitions the row to FAILED.
    pub async fn run(&self, target_date: NaiveDate, num_days: i64) -> Result<RunSummary, Error> {
        let end_date = target_date + chrono::Duration::days(num_days - 1);
        let job_id = self
            .store
            .start_job(
                "daily_forecast",
                Some(target_date),
                Some(end_date),
                serde_json::json!({ "num_days": num_days }),
            )
            .await?;

        match self.run_inner(target_date, num_days).await {
            Ok(summary) => {
                self.store
                    .finish_job_success(job_id, summary.records_processed)
                    .await?;
                let stats = self.feature_store.fallback_stats();
                info!(
                    days = summary.days_processed,
                    records = summary.records_processed,
                    seasonal = stats.seasonal_match,
                    hour_fallback = stats.hour_fallback,
                    zero_fallback = stats.zero_fallback,
                    "forecast run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                self.store.finish_job_failed(job_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, target_date: NaiveDate, num_days: i64) -> Result<RunSummary, Error> {
        let line_names = self.store.all_line_names().await?;
        let mut summary = RunSummary::default();

        for d in 0..num_days {
            let date = target_date + chrono::Duration::days(d);
            let date_str = date.format("%Y-%m-%d").to_string();

            let calendar = self
                .feature_store
                .calendar(&date_str)
                .ok_or_else(|| Error::CalendarMissing(date_str.clone()))?;

            let hourly_weather = self.weather.fetch_daily(date).await;

            let (seasonal, fallback) = self.feature_store.batch_lags(&line_names, date);

            let mut inputs = Vec::with_capacity(line_names.len() * 24);
            for line_name in &line_names {
                for hour in 0..24u32 {
                    let (lags, _tier) = self.feature_store.select(&seasonal, &fallback, line_name, hour);
                    let weather = hourly_weather
                        .get(&hour)
                        .copied()
                        .unwrap_or(crate::weather::FALLBACK_WEATHER);

                    let input = ModelInput {
                        line_name: line_name.clone(),
                        hour_of_day: hour,
                        day_of_week: calendar.day_of_week,
                        is_weekend: calendar.is_weekend,
                        month: calendar.month,
                        season: calendar.season,
                        is_school_term: calendar.is_school_term,
                        is_holiday: calendar.is_holiday,
                        holiday_win_m1: calendar.holiday_win_m1,
                        holiday_win_p1: calendar.holiday_win_p1,
                        temperature_2m: weather.temperature_2m,
                        precipitation: weather.precipitation,
                        wind_speed_10m: weather.wind_speed_10m,
                        lag_24h: 0.0,
                        lag_48h: 0.0,
                        lag_168h: 0.0,
                        roll_mean_24h: 0.0,
                        roll_std_24h: 0.0,
                    }
                    .with_lags(lags);

                    inputs.push(input);
                }
            }

            let predictions = self.model.predict_batch(&inputs);

            let mut rows = Vec::with_capacity(inputs.len());
            for (input, predicted_value) in inputs.iter().zip(predictions.into_iter()) {
                let predicted_value = predicted_value.max(0.0);
                let max_capacity = self.feature_store.max_capacity(&input.line_name);
                let occupancy_pct = if max_capacity > 0.0 {
                    ((predicted_value / max_capacity) * 100.0).round() as i64
                } else {
                    0
                };
                let crowd_level = self
                    .feature_store
                    .crowd_level(&input.line_name, predicted_value, Some(max_capacity));

                rows.push(DailyForecastRow {
                    line_name: input.line_name.clone(),
                    date: date_str.clone(),
                    hour: input.hour_of_day as i64,
                    predicted_value,
                    occupancy_pct,
                    crowd_level: crowd_level.to_string(),
                    max_capacity: max_capacity.round() as i64,
                    trips_per_hour: None,
                    vehicle_capacity: None,
                });
            }

            self.store.upsert_forecasts(&rows).await?;
            summary.days_processed += 1;
            summary.records_processed += rows.len() as i64;
        }

        Ok(summary)
    }

    pub async fn cleanup_stale_forecasts(&self, cutoff: NaiveDate) -> Result<u64, Error> {
        Ok(self.store.cleanup_forecasts(cutoff).await?)
    }
}

/// Retries a failed run with fixed backoff `60s, 120s, 240s` (max 3 extra
/// attempts), matching the scheduler wrapper's contract. Intended to be
/// spawned off a cron callback rather than awaited inline. Returns the final
/// outcome so the caller's job status reflects whether the run ultimately
/// succeeded.
pub async fn run_with_retry(engine: &ForecastEngine, target_date: NaiveDate, num_days: i64) -> Result<(), String> {
    const BACKOFFS_SECS: [u64; 3] = [60, 120, 240];

    let mut last_err = match engine.run(target_date, num_days).await {
        Ok(_) => return Ok(()),
        Err(err) => {
            warn!(error = %err, "forecast run failed, entering retry sequence");
            err.to_string()
        }
    };

    for backoff in BACKOFFS_SECS {
        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        match engine.run(target_date, num_days).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                warn!(error = %err, backoff, "forecast retry attempt failed");
                last_err = err.to_string();
            }
        }
    }

    warn!(target_date = %target_date, "forecast run abandoned after retry budget exhausted");
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::types::Season;
    use std::io::Write;

    #[test]
    fn model_input_round_trip_preserves_categoricals() {
        let input = ModelInput {
            line_name: "500T".into(),
            hour_of_day: 7,
            day_of_week: 2,
            is_weekend: false,
            month: 3,
            season: Season::Spring,
            is_school_term: true,
            is_holiday: false,
            holiday_win_m1: false,
            holiday_win_p1: false,
            temperature_2m: 12.0,
            precipitation: 0.0,
            wind_speed_10m: 4.0,
            lag_24h: 0.0,
            lag_48h: 0.0,
            lag_168h: 0.0,
            roll_mean_24h: 0.0,
            roll_std_24h: 0.0,
        };
        assert_eq!(input.line_name, "500T");
        assert_eq!(input.season.as_str(), "Spring");
    }

    fn fixture_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("forecast_test_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_historical_features(dir: &std::path::Path, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join("historical_features.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "line_name,datetime,hour_of_day,y,lag_24h,lag_48h,lag_168h,roll_mean_24h,roll_std_24h").unwrap();
        for line in lines {
            for hour in 0..24u32 {
                writeln!(
                    file,
                    "{line},2024-01-01T{hour:02}:00:00,{hour},{y},10.0,9.0,8.0,9.5,1.0",
                    line = line,
                    hour = hour,
                    y = 100.0,
                )
                .unwrap();
            }
        }
        path
    }

    fn write_calendar(dir: &std::path::Path, dates: &[&str]) -> std::path::PathBuf {
        let path = dir.join("calendar.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "date,day_of_week,is_weekend,month,season,is_school_term,is_holiday,holiday_win_m1,holiday_win_p1").unwrap();
        for date in dates {
            writeln!(file, "{date},1,false,1,1,true,false,false,false").unwrap();
        }
        path
    }

    fn write_model(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("model.json");
        let artifact = serde_json::json!({
            "feature_names": ["lag_24h"],
            "categories": {},
            "base_score": 0.0,
            "trees": [{"root": {"kind": "leaf", "value": 42.0}}]
        });
        std::fs::File::create(&path).unwrap().write_all(artifact.to_string().as_bytes()).unwrap();
        path
    }

    async fn memory_store_with_lines(dir: &std::path::Path, lines: &[&str]) -> Store {
        let db_path = dir.join("test.db");
        let store = Store::connect(&format!("sqlite://{}", db_path.display())).await.unwrap();
        store.migrate().await.unwrap();
        let seed: Vec<_> = lines.iter().map(|l| (l.to_string(), 1i64, None, None)).collect();
        store.seed_lines_if_empty(&seed).await.unwrap();
        store
    }

    #[tokio::test]
    async fn full_daily_cycle_produces_24_rows_per_line() {
        let dir = fixture_dir("full_cycle");
        let lines = ["500T", "34"];
        let historical = write_historical_features(&dir, &lines);
        let calendar = write_calendar(&dir, &["2024-01-01"]);
        let model_path = write_model(&dir);

        let store = memory_store_with_lines(&dir, &lines).await;
        let feature_store = Arc::new(FeatureStore::load(&historical, &calendar, 3).unwrap());
        let model = Arc::new(Model::load(&model_path).unwrap());
        let weather = WeatherClient::new(Default::default()).unwrap();
        let engine = ForecastEngine::new(store.clone(), feature_store, model, weather);

        let target_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let summary = engine.run(target_date, 1).await.unwrap();

        assert_eq!(summary.records_processed, 48);
        for line in lines {
            let rows = store.forecasts_for(line, target_date).await.unwrap();
            assert_eq!(rows.len(), 24);
            for row in &rows {
                assert!(row.occupancy_pct >= 0 && row.occupancy_pct <= 100);
                assert!(["Low", "Medium", "High", "Very High", "Unknown"].contains(&row.crowd_level.as_str()));
            }
        }
    }

    #[tokio::test]
    async fn missing_calendar_fails_job_with_message() {
        let dir = fixture_dir("missing_calendar");
        let lines = ["500T"];
        let historical = write_historical_features(&dir, &lines);
        let calendar = write_calendar(&dir, &["2024-01-01"]);
        let model_path = write_model(&dir);

        let store = memory_store_with_lines(&dir, &lines).await;
        let feature_store = Arc::new(FeatureStore::load(&historical, &calendar, 3).unwrap());
        let model = Arc::new(Model::load(&model_path).unwrap());
        let weather = WeatherClient::new(Default::default()).unwrap();
        let engine = ForecastEngine::new(store.clone(), feature_store, model, weather);

        let target_date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let result = engine.run(target_date, 1).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("No calendar features"));

        let jobs = store.recent_jobs(5).await.unwrap();
        let job = jobs.iter().find(|j| j.job_type == "daily_forecast").unwrap();
        assert_eq!(job.status, "FAILED");
        assert_eq!(job.records_processed, 0);

        let rows = store.forecasts_for("500T", target_date).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn rerunning_same_day_does_not_duplicate_rows() {
        let dir = fixture_dir("idempotence");
        let lines = ["500T"];
        let historical = write_historical_features(&dir, &lines);
        let calendar = write_calendar(&dir, &["2024-01-01"]);
        let model_path = write_model(&dir);

        let store = memory_store_with_lines(&dir, &lines).await;
        let feature_store = Arc::new(FeatureStore::load(&historical, &calendar, 3).unwrap());
        let model = Arc::new(Model::load(&model_path).unwrap());
        let weather = WeatherClient::new(Default::default()).unwrap();
        let engine = ForecastEngine::new(store.clone(), feature_store, model, weather);

        let target_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        engine.run(target_date, 1).await.unwrap();
        engine.run(target_date, 1).await.unwrap();

        let rows = store.forecasts_for("500T", target_date).await.unwrap();
        assert_eq!(rows.len(), 24);
    }
}
