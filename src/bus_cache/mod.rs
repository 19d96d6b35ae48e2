//! Bus Schedule Cache: per-line SOAP fetch + XML parse, day-type filtering,
//! canonical JSON payload, persistence with retry-until-success semantics.

pub mod xml;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::BusUpstreamConfig;
use crate::db::Store;

const SOAP_ACTION: &str = "http://tempuri.org/GetHatSeferSaati";
const SOAP_ENVELOPE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <GetHatSeferSaati xmlns="http://tempuri.org/">
      <HatKodu>{line_code}</HatKodu>
    </GetHatSeferSaati>
  </soap:Body>
</soap:Envelope>"#;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("xml error: {0}")]
    Xml(#[from] xml::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::db::Error),
    #[error("upstream exhausted {0} attempts")]
    Exhausted(u32),
}

/// `I` weekday, `C` Saturday, `P` Sunday, derived in Europe/Istanbul.
pub fn day_type_for_date(date: NaiveDate) -> &'static str {
    match date.weekday() {
        chrono::Weekday::Sun => "P",
        chrono::Weekday::Sat => "C",
        _ => "I",
    }
}

pub fn today_in(tz: Tz) -> NaiveDate {
    chrono::Utc::now().with_timezone(&tz).date_naive()
}

fn parse_time(time_str: &str) -> Option<(u32, u32)> {
    for format in ["%H:%M", "%H:%M:%S", "%I:%M %p"] {
        if let Ok(t) = chrono::NaiveTime::parse_from_str(time_str.trim(), format) {
            use chrono::Timelike;
            return Some((t.hour(), t.minute()));
        }
    }
    let mut parts = time_str.trim().splitn(2, ':');
    let hour = parts.next()?.trim().parse().ok()?;
    let minute = parts.next()?.trim().parse().ok()?;
    Some((hour, minute))
}

fn parse_route_name(route_name: &str) -> (String, String) {
    match route_name.split_once(" - ") {
        Some((start, end)) => (start.trim().to_string(), end.trim().to_string()),
        None => (route_name.trim().to_string(), String::new()),
    }
}

pub struct BusCacheService {
    client: reqwest::Client,
    config: BusUpstreamConfig,
    store: Store,
    tz: Tz,
    pending: Mutex<HashMap<String, u32>>,
}

#[derive(Debug, Default)]
pub struct PrefetchSummary {
    pub total: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_lines: Vec<(String, String)>,
}

impl BusCacheService {
    pub fn new(config: BusUpstreamConfig, store: Store, tz: Tz) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            store,
            tz,
            pending: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_raw(&self, line_code: &str) -> Result<Vec<xml::RawScheduleRow>, Error> {
        let envelope = SOAP_ENVELOPE_TEMPLATE.replace("{line_code}", line_code);

        let mut last_err = None;
        for attempt in 1..=self.config.max_attempts {
            let result = self
                .client
                .post(&self.config.url)
                .header("Content-Type", "text/xml; charset=utf-8")
                .header("SOAPAction", SOAP_ACTION)
                .body(envelope.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(response) => match response.text().await {
                    Ok(text) => match xml::parse_rows(&text) {
                        Ok(rows) => return Ok(rows),
                        Err(e) => last_err = Some(Error::Xml(e)),
                    },
                    Err(e) => last_err = Some(Error::Request(e)),
                },
                Err(e) => last_err = Some(Error::Request(e)),
            }

            warn!(line_code, attempt, "bus schedule fetch attempt failed");
            if attempt < self.config.max_attempts {
                tokio::time::sleep(std::time::Duration::from_secs(
                    self.config.retry_backoff_secs * attempt as u64,
                ))
                .await;
            }
        }

        Err(last_err.unwrap_or(Error::Exhausted(self.config.max_attempts)))
    }

    /// Normalizes raw rows into the canonical per-cache-row payload.
    pub fn build_filtered_payload(
        &self,
        raw_rows: &[xml::RawScheduleRow],
        target_date: NaiveDate,
    ) -> Value {
        let day_type = day_type_for_date(target_date);

        let mut by_direction: HashMap<&str, Vec<(u32, u32)>> = HashMap::new();
        by_direction.insert("G", Vec::new());
        by_direction.insert("D", Vec::new());
        let mut route_names: HashMap<&str, String> = HashMap::new();

        for row in raw_rows {
            if row.day_type != day_type {
                continue;
            }
            let direction = if row.direction == "D" { "D" } else { "G" };
            if let Some(time) = parse_time(&row.time) {
                by_direction.get_mut(direction).unwrap().push(time);
            }
            if !row.route_name.is_empty() {
                route_names.entry(direction).or_insert_with(|| row.route_name.clone());
            }
        }

        for times in by_direction.values_mut() {
            times.sort();
        }

        let format_times = |times: &[(u32, u32)]| -> Vec<String> {
            times.iter().map(|(h, m)| format!("{:02}:{:02}", h, m)).collect()
        };

        let mut meta = serde_json::Map::new();
        for direction in ["G", "D"] {
            if let Some(route_name) = route_names.get(direction) {
                let (start, end) = parse_route_name(route_name);
                let (start, end) = if direction == "D" { (end, start) } else { (start, end) };
                meta.insert(direction.to_string(), json!({ "start": start, "end": end }));
            }
        }

        let has_service_today = !by_direction["G"].is_empty() || !by_direction["D"].is_empty();
        let data_status = if has_service_today { "OK" } else { "NO_SERVICE_DAY" };

        json!({
            "G": format_times(&by_direction["G"]),
            "D": format_times(&by_direction["D"]),
            "meta": meta,
            "has_service_today": has_service_today,
            "data_status": data_status,
            "day_type": day_type,
            "valid_for": target_date.to_string(),
        })
    }

    fn no_data_payload(target_date: NaiveDate, day_type: &str) -> Value {
        json!({
            "G": [],
            "D": [],
            "meta": {},
            "has_service_today": false,
            "data_status": "NO_DATA",
            "day_type": day_type,
            "valid_for": target_date.to_string(),
        })
    }

    async fn fetch_and_store(&self, line_code: &str, valid_for: NaiveDate) -> Result<Value, Error> {
        let day_type = day_type_for_date(valid_for);
        match self.fetch_raw(line_code).await {
            Ok(raw_rows) => {
                let payload = self.build_filtered_payload(&raw_rows, valid_for);
                self.store
                    .upsert_bus_cache(line_code, valid_for, day_type, &payload, "SUCCESS", None)
                    .await?;
                Ok(payload)
            }
            Err(err) => {
                let payload = Self::no_data_payload(valid_for, day_type);
                self.store
                    .upsert_bus_cache(
                        line_code,
                        valid_for,
                        day_type,
                        &payload,
                        "FAILED",
                        Some(&err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// `get_or_fetch`: fresh exact match, else stale fallback within
    /// `max_stale_days`, else a live fetch.
    pub async fn get_or_fetch(
        &self,
        line_code: &str,
        valid_for: NaiveDate,
        max_stale_days: i64,
    ) -> (Option<Value>, bool, bool) {
        let day_type = day_type_for_date(valid_for);

        if let Ok(Some(row)) = self.store.bus_cache_exact(line_code, valid_for, day_type).await {
            if let Ok(payload) = serde_json::from_str(&row.payload) {
                return (Some(payload), false, false);
            }
        }

        let stale_cutoff = valid_for - chrono::Duration::days(max_stale_days);
        if let Ok(Some(row)) = self.store.bus_cache_latest_stale(line_code, day_type, valid_for).await {
            if let Ok(parsed_valid_for) = NaiveDate::parse_from_str(&row.valid_for, "%Y-%m-%d") {
                if parsed_valid_for >= stale_cutoff {
                    if let Ok(payload) = serde_json::from_str(&row.payload) {
                        return (Some(payload), true, false);
                    }
                }
            }
        }

        match self.fetch_and_store(line_code, valid_for).await {
            Ok(payload) => (Some(payload), false, true),
            Err(_) => (None, true, true),
        }
    }

    /// Enumerates `bus_line_codes` and fetches/stores each, skipping lines
    /// that already have a SUCCESS row unless `force`.
    pub async fn prefetch_all(
        &self,
        valid_for: NaiveDate,
        force: bool,
        limit: Option<usize>,
        retention_days: i64,
    ) -> Result<PrefetchSummary, Error> {
        let mut lines = self.store.bus_line_codes().await?;
        if let Some(limit) = limit {
            lines.truncate(limit);
        }
        let day_type = day_type_for_date(valid_for);

        let mut summary = PrefetchSummary {
            total: lines.len(),
            ..Default::default()
        };

        for line_code in &lines {
            if !force {
                if let Ok(Some(_)) = self.store.bus_cache_exact(line_code, valid_for, day_type).await {
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.fetch_and_store(line_code, valid_for).await {
                Ok(_) => summary.stored += 1,
                Err(err) => {
                    summary.failed += 1;
                    summary.failed_lines.push((line_code.clone(), err.to_string()));
                    self.mark_pending(line_code, valid_for);
                }
            }
        }

        let cutoff = valid_for - chrono::Duration::days(retention_days);
        let deleted = self.store.cleanup_bus_cache(cutoff).await?;
        info!(
            total = summary.total,
            stored = summary.stored,
            skipped = summary.skipped,
            failed = summary.failed,
            retention_deleted = deleted,
            "bus schedule prefetch complete"
        );

        Ok(summary)
    }

    fn pending_key(line_code: &str, valid_for: NaiveDate) -> String {
        format!("{}:{}", line_code, valid_for)
    }

    fn mark_pending(&self, line_code: &str, valid_for: NaiveDate) {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(Self::pending_key(line_code, valid_for)).or_insert(0);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Drains the pending map sequentially; abandons an entry once it has
    /// failed 10 times.
    pub async fn run_retry_pass(&self) {
        let keys: Vec<String> = self.pending.lock().unwrap().keys().cloned().collect();
        for key in keys {
            let Some((line_code, valid_for)) = key.split_once(':').and_then(|(l, d)| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d").ok().map(|d| (l.to_string(), d))
            }) else {
                self.pending.lock().unwrap().remove(&key);
                continue;
            };

            match self.fetch_and_store(&line_code, valid_for).await {
                Ok(_) => {
                    self.pending.lock().unwrap().remove(&key);
                }
                Err(_) => {
                    let mut pending = self.pending.lock().unwrap();
                    if let Some(count) = pending.get_mut(&key) {
                        *count += 1;
                        if *count >= 10 {
                            warn!(key, "bus schedule retry abandoned after 10 attempts");
                            pending.remove(&key);
                        }
                    }
                }
            }
        }
    }
}

/// Given a cached payload, counts G+D departures by hour into a length-24
/// vector, feeding the forecast's optional `trips_per_hour` field.
pub fn trips_per_hour_from_payload(payload: &Value) -> [i64; 24] {
    let mut counts = [0i64; 24];
    for direction in ["G", "D"] {
        let Some(times) = payload.get(direction).and_then(|v| v.as_array()) else {
            continue;
        };
        for time in times {
            let Some(time_str) = time.as_str() else { continue };
            if let Some((hour, _)) = parse_time(time_str) {
                if (hour as usize) < 24 {
                    counts[hour as usize] += 1;
                }
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_type_matches_iso_weekday() {
        // 2024-06-14 is a Friday
        assert_eq!(day_type_for_date(NaiveDate::from_ymd_opt(2024, 6, 14).unwrap()), "I");
        // 2024-06-15 is a Saturday
        assert_eq!(day_type_for_date(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()), "C");
        // 2024-06-16 is a Sunday
        assert_eq!(day_type_for_date(NaiveDate::from_ymd_opt(2024, 6, 16).unwrap()), "P");
    }

    #[test]
    fn route_name_swaps_for_d_direction() {
        assert_eq!(
            parse_route_name("TAKSIM - 4.LEVENT"),
            ("TAKSIM".to_string(), "4.LEVENT".to_string())
        );
    }

    #[test]
    fn trips_per_hour_counts_both_directions() {
        let payload = json!({
            "G": ["08:00", "08:30", "09:00"],
            "D": ["08:15"],
        });
        let counts = trips_per_hour_from_payload(&payload);
        assert_eq!(counts[8], 3);
        assert_eq!(counts[9], 1);
    }
}
