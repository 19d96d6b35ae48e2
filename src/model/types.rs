use serde::Serialize;

use crate::feature_store::types::{LagFeatures, Season};

/// The model-input row the Forecast Engine composes per (line, hour).
/// Field order mirrors the columns documented on the pretrained artifact;
/// `line_name` and `season` are the two categorical columns.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInput {
    pub line_name: String,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub month: u32,
    pub season: Season,
    pub is_school_term: bool,
    pub is_holiday: bool,
    pub holiday_win_m1: bool,
    pub holiday_win_p1: bool,
    pub temperature_2m: f64,
    pub precipitation: f64,
    pub wind_speed_10m: f64,
    pub lag_24h: f64,
    pub lag_48h: f64,
    pub lag_168h: f64,
    pub roll_mean_24h: f64,
    pub roll_std_24h: f64,
}

impl ModelInput {
    pub fn with_lags(mut self, lags: LagFeatures) -> Self {
        self.lag_24h = lags.lag_24h;
        self.lag_48h = lags.lag_48h;
        self.lag_168h = lags.lag_168h;
        self.roll_mean_24h = lags.roll_mean_24h;
        self.roll_std_24h = lags.roll_std_24h;
        self
    }
}
