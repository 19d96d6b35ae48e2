//! Metro (rail) Schedule Cache: per (station, direction) JSON fetch against
//! the Metro Istanbul upstream, keyed the same way the upstream keys its own
//! departure boards. Mirrors [`crate::bus_cache`]'s fetch/retry/persist shape
//! but the wire format is JSON, not SOAP/XML, and the cache key carries a
//! station and direction rather than a single line code.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::MetroUpstreamConfig;
use crate::db::Store;
use crate::topology::Topology;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::db::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("upstream exhausted {0} attempts")]
    Exhausted(u32),
}

pub struct MetroCacheService {
    client: reqwest::Client,
    config: MetroUpstreamConfig,
    store: Store,
    pending: Mutex<HashMap<String, u32>>,
}

#[derive(Debug, Default)]
pub struct PrefetchSummary {
    pub total: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_keys: Vec<(String, String, String)>,
}

impl MetroCacheService {
    pub fn new(config: MetroUpstreamConfig, store: Store) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            store,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches a station/direction timetable. The upstream contract is
    /// `{Success, Error: {Message}, Data: [{TimeInfos: {Times}, LastStation,
    /// ...}]}`; the whole parsed body is returned unchanged so callers can
    /// store it verbatim rather than reshaping it into a bespoke schema.
    async fn fetch_raw(&self, station_id: &str, direction_id: &str) -> Result<Value, Error> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_attempts {
            let result = self
                .client
                .post(&self.config.url)
                .json(&json!({ "BoardingStationId": station_id, "DirectionId": direction_id }))
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(response) => match response.json::<Value>().await {
                    Ok(body) => {
                        let success = body.get("Success").and_then(|v| v.as_bool()).unwrap_or(false);
                        if success {
                            return Ok(body);
                        }
                        let message = body
                            .get("Error")
                            .and_then(|e| e.get("Message"))
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown metro API error")
                            .to_string();
                        last_err = Some(Error::Upstream(message));
                    }
                    Err(e) => last_err = Some(Error::Request(e)),
                },
                Err(e) => last_err = Some(Error::Request(e)),
            }

            warn!(station_id, direction_id, attempt, "metro schedule fetch attempt failed");
            if attempt < self.config.max_attempts {
                tokio::time::sleep(std::time::Duration::from_secs(
                    self.config.retry_backoff_secs * attempt as u64,
                ))
                .await;
            }
        }

        Err(last_err.unwrap_or(Error::Exhausted(self.config.max_attempts)))
    }

    fn no_data_payload() -> Value {
        json!({
            "Success": false,
            "Error": { "Message": "no cached data available" },
            "Data": [],
        })
    }

    async fn fetch_and_store(
        &self,
        station_id: &str,
        direction_id: &str,
        line_code: Option<&str>,
        station_name: Option<&str>,
        direction_name: Option<&str>,
        valid_for: NaiveDate,
    ) -> Result<Value, Error> {
        match self.fetch_raw(station_id, direction_id).await {
            Ok(payload) => {
                self.store
                    .upsert_metro_cache(
                        station_id,
                        direction_id,
                        line_code,
                        station_name,
                        direction_name,
                        valid_for,
                        &payload,
                        "SUCCESS",
                        None,
                    )
                    .await?;
                Ok(payload)
            }
            Err(err) => {
                let payload = Self::no_data_payload();
                self.store
                    .upsert_metro_cache(
                        station_id,
                        direction_id,
                        line_code,
                        station_name,
                        direction_name,
                        valid_for,
                        &payload,
                        "FAILED",
                        Some(&err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// `get_or_fetch`: exact match, else stale fallback within
    /// `max_stale_days` (2 days normally, widened to 7 on total upstream
    /// failure by the caller), else a live fetch.
    pub async fn get_or_fetch(
        &self,
        station_id: &str,
        direction_id: &str,
        line_code: Option<&str>,
        valid_for: NaiveDate,
        max_stale_days: i64,
    ) -> (Option<Value>, bool, bool) {
        if let Ok(Some(row)) = self.store.metro_cache_exact(station_id, direction_id, valid_for).await {
            if let Ok(payload) = serde_json::from_str(&row.payload) {
                return (Some(payload), false, false);
            }
        }

        let stale_cutoff = valid_for - chrono::Duration::days(max_stale_days);
        if let Ok(Some(row)) = self
            .store
            .metro_cache_latest_stale(station_id, direction_id, valid_for)
            .await
        {
            if let Ok(parsed_valid_for) = NaiveDate::parse_from_str(&row.valid_for, "%Y-%m-%d") {
                if parsed_valid_for >= stale_cutoff {
                    if let Ok(payload) = serde_json::from_str(&row.payload) {
                        return (Some(payload), true, false);
                    }
                }
            }
        }

        match self.fetch_and_store(station_id, direction_id, line_code, None, None, valid_for).await {
            Ok(payload) => (Some(payload), false, true),
            Err(_) => (None, true, true),
        }
    }

    /// Enumerates every (station, direction) pair from the static topology
    /// and fetches/stores each, skipping pairs that already have a SUCCESS
    /// row unless `force`.
    pub async fn prefetch_all(
        &self,
        topology: &Topology,
        valid_for: NaiveDate,
        force: bool,
        retention_days: i64,
    ) -> Result<PrefetchSummary, Error> {
        let pairs = topology.station_direction_pairs();
        let mut summary = PrefetchSummary {
            total: pairs.len(),
            ..Default::default()
        };

        for (station_id, direction_id, line_code) in &pairs {
            if !force {
                if let Ok(Some(_)) = self.store.metro_cache_exact(station_id, direction_id, valid_for).await {
                    summary.skipped += 1;
                    continue;
                }
            }

            let station_name = topology.station_name(line_code, station_id);
            match self
                .fetch_and_store(station_id, direction_id, Some(line_code), station_name, None, valid_for)
                .await
            {
                Ok(_) => summary.stored += 1,
                Err(err) => {
                    summary.failed += 1;
                    summary
                        .failed_keys
                        .push((station_id.clone(), direction_id.clone(), err.to_string()));
                    self.mark_pending(station_id, direction_id, valid_for);
                }
            }
        }

        let cutoff = valid_for - chrono::Duration::days(retention_days);
        let deleted = self.store.cleanup_metro_cache(cutoff).await?;
        info!(
            total = summary.total,
            stored = summary.stored,
            skipped = summary.skipped,
            failed = summary.failed,
            retention_deleted = deleted,
            "metro schedule prefetch complete"
        );

        Ok(summary)
    }

    fn pending_key(station_id: &str, direction_id: &str, valid_for: NaiveDate) -> String {
        format!("{}:{}:{}", station_id, direction_id, valid_for)
    }

    fn mark_pending(&self, station_id: &str, direction_id: &str, valid_for: NaiveDate) {
        let mut pending = self.pending.lock().unwrap();
        pending
            .entry(Self::pending_key(station_id, direction_id, valid_for))
            .or_insert(0);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Drains the pending map sequentially; abandons an entry once it has
    /// failed 10 times.
    pub async fn run_retry_pass(&self) {
        let keys: Vec<String> = self.pending.lock().unwrap().keys().cloned().collect();
        for key in keys {
            let parts: Vec<&str> = key.splitn(3, ':').collect();
            let (Some(station_id), Some(direction_id), Some(valid_for_str)) =
                (parts.first(), parts.get(1), parts.get(2))
            else {
                self.pending.lock().unwrap().remove(&key);
                continue;
            };
            let Ok(valid_for) = NaiveDate::parse_from_str(valid_for_str, "%Y-%m-%d") else {
                self.pending.lock().unwrap().remove(&key);
                continue;
            };

            match self.fetch_and_store(station_id, direction_id, None, None, None, valid_for).await {
                Ok(_) => {
                    self.pending.lock().unwrap().remove(&key);
                }
                Err(_) => {
                    let mut pending = self.pending.lock().unwrap();
                    if let Some(count) = pending.get_mut(&key) {
                        *count += 1;
                        if *count >= 10 {
                            warn!(key, "metro schedule retry abandoned after 10 attempts");
                            pending.remove(&key);
                        }
                    }
                }
            }
        }
    }

    /// Projects a length-24 trips-per-hour vector for `line_code` by unioning
    /// departures across all cached (station, direction) pairs at the line's
    /// termini. `M1` pools its `M1A`/`M1B` branches via
    /// [`crate::topology::branches_for`].
    pub async fn trips_per_hour_for_line(
        &self,
        line_code: &str,
        valid_for: NaiveDate,
    ) -> Result<[i64; 24], Error> {
        let mut counts = [0i64; 24];
        for branch in crate::topology::branches_for(line_code) {
            let rows = self.store.metro_cache_by_line(branch, valid_for).await?;
            for row in rows {
                let Ok(payload) = serde_json::from_str::<Value>(&row.payload) else {
                    continue;
                };
                for time_str in extract_times(&payload) {
                    if let Some(hour_str) = time_str.get(0..2) {
                        if let Ok(hour) = hour_str.parse::<usize>() {
                            if hour < 24 {
                                counts[hour] += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(counts)
    }
}

/// Unions `Data[].TimeInfos.Times` across every row of a stored timetable
/// payload into a sorted, deduplicated departure list. Callers that need a
/// flat schedule (the `/metro/schedule` and `/metro/duration` handlers, the
/// trips-per-hour projection) derive it from the verbatim payload through
/// this rather than the cache storing a second, pre-flattened shape.
pub fn extract_times(payload: &Value) -> Vec<String> {
    let mut times = BTreeSet::new();
    if let Some(rows) = payload.get("Data").and_then(|v| v.as_array()) {
        for row in rows {
            let Some(raw_times) = row.get("TimeInfos").and_then(|t| t.get("Times")).and_then(|v| v.as_array()) else {
                continue;
            };
            for t in raw_times {
                if let Some(s) = t.as_str() {
                    times.insert(s.to_string());
                }
            }
        }
    }
    times.into_iter().collect()
}

pub fn has_service(payload: &Value) -> bool {
    payload.get("Success").and_then(|v| v.as_bool()).unwrap_or(false) && !extract_times(payload).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(times: &[&str]) -> Value {
        json!({
            "Success": true,
            "Error": null,
            "Data": [
                { "TimeInfos": { "Times": times }, "LastStation": "4.Levent" },
            ],
        })
    }

    #[test]
    fn extract_times_dedupes_and_sorts() {
        let payload = json!({
            "Success": true,
            "Data": [
                { "TimeInfos": { "Times": ["08:30", "08:00"] } },
                { "TimeInfos": { "Times": ["08:00", "09:15"] } },
            ],
        });
        assert_eq!(extract_times(&payload), vec!["08:00", "08:30", "09:15"]);
    }

    #[test]
    fn extract_times_on_failure_shape_is_empty() {
        let payload = MetroCacheService::no_data_payload();
        assert!(extract_times(&payload).is_empty());
    }

    #[test]
    fn has_service_requires_success_and_nonempty_times() {
        assert!(has_service(&sample_payload(&["08:00"])));
        assert!(!has_service(&sample_payload(&[])));
        assert!(!has_service(&MetroCacheService::no_data_payload()));
    }
}
