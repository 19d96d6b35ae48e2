//! In-memory Feature Store: loads the historical-features and calendar
//! columnar files once at startup and answers per-(line, hour, date) and
//! batch lag/rolling feature lookups with a tiered seasonal -> hour -> zero
//! fallback.

pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Datelike, NaiveDate};
use tracing::info;

use types::{
    CalendarFeatures, CalendarRecord, FallbackStats, FallbackTier, HistoricalFeatureRecord,
    LagFeatures, Season,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse csv row: {0}")]
    Csv(#[from] csv::Error),
    #[error("historical-features file contains no rows")]
    Empty,
}

/// latest lag values observed, keyed by a composite of (line, hour) plus an
/// optional (month, day, year) window for the seasonal table.
#[derive(Debug, Clone)]
struct SeasonalEntry {
    year: i32,
    datetime: String,
    lags: Option<LagFeatures>,
}

#[derive(Debug, Clone)]
struct FallbackEntry {
    datetime: String,
    lags: Option<LagFeatures>,
}

pub struct FeatureStore {
    max_y: HashMap<String, f64>,
    global_avg_max: f64,
    seasonal: HashMap<(String, u32, u32, u32), Vec<SeasonalEntry>>,
    fallback: HashMap<(String, u32), FallbackEntry>,
    calendar: HashMap<String, CalendarFeatures>,
    max_seasonal_lookback_years: i32,
    seasonal_match: AtomicU64,
    hour_fallback: AtomicU64,
    zero_fallback: AtomicU64,
}

impl FeatureStore {
    pub fn load(
        historical_features_path: &Path,
        calendar_path: &Path,
        max_seasonal_lookback_years: i32,
    ) -> Result<Self, Error> {
        let records = read_csv::<HistoricalFeatureRecord>(historical_features_path)?;
        if records.is_empty() {
            return Err(Error::Empty);
        }

        let mut max_y: HashMap<String, f64> = HashMap::new();
        // key: (line_name, hour_of_day, month, day) -> entries per year, latest datetime wins per year
        let mut seasonal_raw: HashMap<(String, u32, u32, u32), HashMap<i32, SeasonalEntry>> =
            HashMap::new();
        let mut fallback: HashMap<(String, u32), FallbackEntry> = HashMap::new();

        for record in &records {
            let entry = max_y.entry(record.line_name.clone()).or_insert(record.y);
            if record.y > *entry {
                *entry = record.y;
            }

            let lags = complete_lags(record);
            let date = parse_date_prefix(&record.datetime);

            if let Some(date) = date {
                let key = (record.line_name.clone(), record.hour_of_day, date.month(), date.day());
                let by_year = seasonal_raw.entry(key).or_default();
                let slot = by_year.entry(date.year()).or_insert_with(|| SeasonalEntry {
                    year: date.year(),
                    datetime: record.datetime.clone(),
                    lags,
                });
                if record.datetime >= slot.datetime {
                    slot.datetime = record.datetime.clone();
                    slot.lags = lags;
                }
            }

            let fb_key = (record.line_name.clone(), record.hour_of_day);
            let fb_slot = fallback.entry(fb_key).or_insert_with(|| FallbackEntry {
                datetime: record.datetime.clone(),
                lags,
            });
            if record.datetime >= fb_slot.datetime {
                fb_slot.datetime = record.datetime.clone();
                fb_slot.lags = lags;
            }
        }

        let seasonal: HashMap<(String, u32, u32, u32), Vec<SeasonalEntry>> = seasonal_raw
            .into_iter()
            .map(|(k, by_year)| {
                let mut entries: Vec<SeasonalEntry> = by_year.into_values().collect();
                entries.sort_by(|a, b| b.year.cmp(&a.year));
                (k, entries)
            })
            .collect();

        let global_avg_max = if max_y.is_empty() {
            0.0
        } else {
            max_y.values().sum::<f64>() / max_y.len() as f64
        };

        let calendar_records = read_csv::<CalendarRecord>(calendar_path)?;
        let calendar = calendar_records
            .into_iter()
            .map(|r| {
                let features = CalendarFeatures {
                    day_of_week: r.day_of_week,
                    is_weekend: r.is_weekend,
                    month: r.month,
                    season: Season::from_season_id(r.season),
                    is_school_term: r.is_school_term,
                    is_holiday: r.is_holiday,
                    holiday_win_m1: r.holiday_win_m1,
                    holiday_win_p1: r.holiday_win_p1,
                };
                (r.date, features)
            })
            .collect();

        info!(
            lines = max_y.len(),
            rows = records.len(),
            calendar_days = calendar_path.display().to_string(),
            "loaded feature store"
        );

        Ok(Self {
            max_y,
            global_avg_max,
            seasonal,
            fallback,
            calendar,
            max_seasonal_lookback_years,
            seasonal_match: AtomicU64::new(0),
            hour_fallback: AtomicU64::new(0),
            zero_fallback: AtomicU64::new(0),
        })
    }

    pub fn calendar(&self, date_str: &str) -> Option<CalendarFeatures> {
        self.calendar.get(date_str).copied()
    }

    pub fn max_capacity(&self, line_name: &str) -> f64 {
        self.max_y
            .get(line_name)
            .copied()
            .unwrap_or(self.global_avg_max)
    }

    pub fn global_avg_max(&self) -> f64 {
        self.global_avg_max
    }

    pub fn line_count(&self) -> usize {
        self.max_y.len()
    }

    /// Single (line, hour, target_date) lookup with the three-tier fallback.
    pub fn lags(&self, line_name: &str, hour: u32, target_date: NaiveDate) -> LagFeatures {
        if let Some(lags) = self.seasonal_lookup(line_name, hour, target_date) {
            self.seasonal_match.fetch_add(1, Ordering::Relaxed);
            return lags;
        }
        if let Some(lags) = self.fallback.get(&(line_name.to_string(), hour)).and_then(|e| e.lags) {
            self.hour_fallback.fetch_add(1, Ordering::Relaxed);
            return lags;
        }
        self.zero_fallback.fetch_add(1, Ordering::Relaxed);
        LagFeatures::ZERO
    }

    fn seasonal_lookup(&self, line_name: &str, hour: u32, target_date: NaiveDate) -> Option<LagFeatures> {
        let key = (line_name.to_string(), hour, target_date.month(), target_date.day());
        let entries = self.seasonal.get(&key)?;
        for entry in entries {
            let years_ago = target_date.year() - entry.year;
            if years_ago > self.max_seasonal_lookback_years {
                continue;
            }
            if let Some(lags) = entry.lags {
                return Some(lags);
            }
        }
        None
    }

    /// Batch variant: returns raw seasonal/fallback maps for every (line, hour)
    /// pair in `line_names x [0..24)`; callers apply the tier decision via
    /// [`FeatureStore::select`].
    pub fn batch_lags(
        &self,
        line_names: &[String],
        target_date: NaiveDate,
    ) -> (HashMap<(String, u32), LagFeatures>, HashMap<(String, u32), LagFeatures>) {
        let mut seasonal_out = HashMap::new();
        let mut fallback_out = HashMap::new();

        for line_name in line_names {
            for hour in 0..24u32 {
                if let Some(lags) = self.seasonal_lookup(line_name, hour, target_date) {
                    seasonal_out.insert((line_name.clone(), hour), lags);
                }
                if let Some(lags) = self.fallback.get(&(line_name.clone(), hour)).and_then(|e| e.lags) {
                    fallback_out.insert((line_name.clone(), hour), lags);
                }
            }
        }

        (seasonal_out, fallback_out)
    }

    /// Applies the seasonal -> hour -> zero decision to a precomputed batch
    /// pair of maps, incrementing the matching counter.
    pub fn select(
        &self,
        seasonal: &HashMap<(String, u32), LagFeatures>,
        fallback: &HashMap<(String, u32), LagFeatures>,
        line_name: &str,
        hour: u32,
    ) -> (LagFeatures, FallbackTier) {
        let key = (line_name.to_string(), hour);
        if let Some(lags) = seasonal.get(&key) {
            self.seasonal_match.fetch_add(1, Ordering::Relaxed);
            return (*lags, FallbackTier::Seasonal);
        }
        if let Some(lags) = fallback.get(&key) {
            self.hour_fallback.fetch_add(1, Ordering::Relaxed);
            return (*lags, FallbackTier::Hour);
        }
        self.zero_fallback.fetch_add(1, Ordering::Relaxed);
        (LagFeatures::ZERO, FallbackTier::Zero)
    }

    pub fn crowd_level(&self, line_name: &str, predicted_value: f64, max_capacity: Option<f64>) -> &'static str {
        let capacity = max_capacity.unwrap_or_else(|| self.max_capacity(line_name));
        if capacity <= 0.0 {
            return "Unknown";
        }
        let occupancy = predicted_value / capacity;
        if occupancy < 0.30 {
            "Low"
        } else if occupancy < 0.60 {
            "Medium"
        } else if occupancy < 0.90 {
            "High"
        } else {
            "Very High"
        }
    }

    pub fn fallback_stats(&self) -> FallbackStats {
        FallbackStats {
            seasonal_match: self.seasonal_match.load(Ordering::Relaxed),
            hour_fallback: self.hour_fallback.load(Ordering::Relaxed),
            zero_fallback: self.zero_fallback.load(Ordering::Relaxed),
        }
    }

    pub fn reset_fallback_stats(&self) {
        self.seasonal_match.store(0, Ordering::Relaxed);
        self.hour_fallback.store(0, Ordering::Relaxed);
        self.zero_fallback.store(0, Ordering::Relaxed);
    }
}

fn complete_lags(record: &HistoricalFeatureRecord) -> Option<LagFeatures> {
    Some(LagFeatures {
        lag_24h: record.lag_24h?,
        lag_48h: record.lag_48h?,
        lag_168h: record.lag_168h?,
        roll_mean_24h: record.roll_mean_24h?,
        roll_std_24h: record.roll_std_24h?,
    })
}

fn parse_date_prefix(datetime: &str) -> Option<NaiveDate> {
    let date_part = datetime.get(0..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

fn read_csv<T: for<'de> serde::Deserialize<'de>>(path: &Path) -> Result<Vec<T>, Error> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        if matches!(e.kind(), csv::ErrorKind::Io(_)) {
            match e.into_kind() {
                csv::ErrorKind::Io(io_err) => Error::Io {
                    path: path.display().to_string(),
                    source: io_err,
                },
                _ => unreachable!(),
            }
        } else {
            Error::Csv(e)
        }
    })?;
    let mut out = Vec::new();
    for result in reader.deserialize() {
        out.push(result?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn seasonal_tier_wins_within_lookback() {
        let dir = std::env::temp_dir().join(format!("fs_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let features = write_csv(
            &dir,
            "features.csv",
            "line_name,datetime,hour_of_day,y,lag_24h,lag_48h,lag_168h,roll_mean_24h,roll_std_24h\n\
             34,2023-11-24T08:00:00,8,50.0,10.0,11.0,12.0,9.0,1.0\n\
             34,2019-11-24T08:00:00,8,40.0,1.0,1.0,1.0,1.0,1.0\n",
        );
        let calendar = write_csv(
            &dir,
            "calendar.csv",
            "date,day_of_week,is_weekend,month,season,is_school_term,is_holiday,holiday_win_m1,holiday_win_p1\n\
             2024-11-24,6,true,11,4,false,false,false,false\n",
        );

        let store = FeatureStore::load(&features, &calendar, 3).unwrap();
        let target = NaiveDate::from_ymd_opt(2024, 11, 24).unwrap();
        let lags = store.lags("34", 8, target);
        assert_eq!(lags.lag_24h, 10.0);
        let stats = store.fallback_stats();
        assert_eq!(stats.seasonal_match, 1);
        assert_eq!(stats.total(), 1);
    }

    #[test]
    fn seasonal_row_older_than_lookback_is_skipped() {
        let dir = std::env::temp_dir().join(format!("fs_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let features = write_csv(
            &dir,
            "features.csv",
            "line_name,datetime,hour_of_day,y,lag_24h,lag_48h,lag_168h,roll_mean_24h,roll_std_24h\n\
             34,2019-11-24T08:00:00,8,40.0,1.0,1.0,1.0,1.0,1.0\n\
             34,2024-11-24T09:00:00,9,40.0,2.0,2.0,2.0,2.0,2.0\n",
        );
        let calendar = write_csv(
            &dir,
            "calendar.csv",
            "date,day_of_week,is_weekend,month,season,is_school_term,is_holiday,holiday_win_m1,holiday_win_p1\n\
             2024-11-24,6,true,11,4,false,false,false,false\n",
        );

        let store = FeatureStore::load(&features, &calendar, 3).unwrap();
        let target = NaiveDate::from_ymd_opt(2024, 11, 24).unwrap();
        let lags = store.lags("34", 8, target);
        assert_eq!(lags, LagFeatures::ZERO);
        let stats = store.fallback_stats();
        assert_eq!(stats.zero_fallback, 1);
    }

    #[test]
    fn crowd_level_thresholds() {
        let dir = std::env::temp_dir().join(format!("fs_test3_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let features = write_csv(
            &dir,
            "features.csv",
            "line_name,datetime,hour_of_day,y,lag_24h,lag_48h,lag_168h,roll_mean_24h,roll_std_24h\n\
             34,2024-01-01T00:00:00,0,100.0,1.0,1.0,1.0,1.0,1.0\n",
        );
        let calendar = write_csv(
            &dir,
            "calendar.csv",
            "date,day_of_week,is_weekend,month,season,is_school_term,is_holiday,holiday_win_m1,holiday_win_p1\n",
        );
        let store = FeatureStore::load(&features, &calendar, 3).unwrap();
        assert_eq!(store.crowd_level("34", 20.0, Some(100.0)), "Low");
        assert_eq!(store.crowd_level("34", 45.0, Some(100.0)), "Medium");
        assert_eq!(store.crowd_level("34", 80.0, Some(100.0)), "High");
        assert_eq!(store.crowd_level("34", 95.0, Some(100.0)), "Very High");
        assert_eq!(store.crowd_level("34", 0.0, Some(100.0)), "Low");
        assert_eq!(store.crowd_level("34", 50.0, Some(0.0)), "Unknown");
    }
}
