//! Weather upstream client. A synchronous-shaped fetch (awaited, manual
//! retry loop, no retry crate) matching §4.8's contract: on total failure a
//! fixed fallback snapshot is applied to all 24 hours rather than surfacing
//! an error to the Forecast Engine.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

use crate::config::WeatherConfig;

#[derive(Debug, Clone, Copy)]
pub struct HourlyWeather {
    pub temperature_2m: f64,
    pub precipitation: f64,
    pub wind_speed_10m: f64,
}

pub const FALLBACK_WEATHER: HourlyWeather = HourlyWeather {
    temperature_2m: 15.0,
    precipitation: 0.0,
    wind_speed_10m: 5.0,
};

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: Option<HourlyBlock>,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<f64>,
    precipitation: Vec<f64>,
    wind_speed_10m: Vec<f64>,
}

#[derive(Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    config: WeatherConfig,
}

impl WeatherClient {
    pub fn new(config: WeatherConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetches hourly weather for `date`, retrying up to `max_retries` times
    /// with a fixed 2s pause. Falls back to [`FALLBACK_WEATHER`] for every
    /// hour on total failure rather than failing the forecast run.
    pub async fn fetch_daily(&self, date: NaiveDate) -> HashMap<u32, HourlyWeather> {
        for attempt in 1..=self.config.max_retries {
            match self.try_fetch(date).await {
                Ok(hourly) => return hourly,
                Err(err) => {
                    warn!(attempt, date = %date, error = %err, "weather fetch attempt failed");
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        }

        warn!(date = %date, "weather upstream exhausted retries, using fallback snapshot");
        (0..24u32).map(|h| (h, FALLBACK_WEATHER)).collect()
    }

    async fn try_fetch(&self, date: NaiveDate) -> Result<HashMap<u32, HourlyWeather>, reqwest::Error> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let response = self
            .client
            .get(&self.config.url)
            .query(&[
                ("latitude", self.config.latitude.to_string()),
                ("longitude", self.config.longitude.to_string()),
                ("start_date", date_str.clone()),
                ("end_date", date_str),
                (
                    "hourly",
                    "temperature_2m,precipitation,wind_speed_10m".to_string(),
                ),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: OpenMeteoResponse = response.json().await?;
        Ok(process_response(parsed))
    }
}

fn process_response(response: OpenMeteoResponse) -> HashMap<u32, HourlyWeather> {
    let mut out = HashMap::new();
    let Some(hourly) = response.hourly else {
        return out;
    };

    for (i, time_str) in hourly.time.iter().enumerate() {
        let Some(hour) = parse_hour(time_str) else {
            continue;
        };
        let temperature = hourly.temperature_2m.get(i).copied().unwrap_or(FALLBACK_WEATHER.temperature_2m);
        let precipitation = hourly.precipitation.get(i).copied().unwrap_or(FALLBACK_WEATHER.precipitation);
        let wind = hourly.wind_speed_10m.get(i).copied().unwrap_or(FALLBACK_WEATHER.wind_speed_10m);
        out.insert(
            hour,
            HourlyWeather {
                temperature_2m: temperature,
                precipitation,
                wind_speed_10m: wind,
            },
        );
    }
    out
}

fn parse_hour(time_str: &str) -> Option<u32> {
    chrono::NaiveDateTime::parse_from_str(time_str, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|dt| dt.hour_value())
        .or_else(|| time_str.get(11..13)?.parse().ok())
}

trait HourValue {
    fn hour_value(&self) -> u32;
}

impl HourValue for chrono::NaiveDateTime {
    fn hour_value(&self) -> u32 {
        use chrono::Timelike;
        self.hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_response_builds_per_hour_map() {
        let response = OpenMeteoResponse {
            hourly: Some(HourlyBlock {
                time: vec!["2024-06-14T00:00".into(), "2024-06-14T01:00".into()],
                temperature_2m: vec![10.0, 11.0],
                precipitation: vec![0.0, 0.1],
                wind_speed_10m: vec![3.0, 4.0],
            }),
        };
        let map = process_response(response);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0].temperature_2m, 10.0);
        assert_eq!(map[&1].wind_speed_10m, 4.0);
    }

    #[test]
    fn missing_hourly_block_yields_empty_map() {
        let response = OpenMeteoResponse { hourly: None };
        assert!(process_response(response).is_empty());
    }
}
