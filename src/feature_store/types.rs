use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The five lag/rolling features the model expects for one (line, hour).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LagFeatures {
    pub lag_24h: f64,
    pub lag_48h: f64,
    pub lag_168h: f64,
    pub roll_mean_24h: f64,
    pub roll_std_24h: f64,
}

impl LagFeatures {
    pub const ZERO: LagFeatures = LagFeatures {
        lag_24h: 0.0,
        lag_48h: 0.0,
        lag_168h: 0.0,
        roll_mean_24h: 0.0,
        roll_std_24h: 0.0,
    };
}

/// Raw CSV row for the historical-features file. Lag/rolling columns may be
/// empty, which this crate treats as missing rather than zero.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalFeatureRecord {
    pub line_name: String,
    pub datetime: String,
    pub hour_of_day: u32,
    pub y: f64,
    pub lag_24h: Option<f64>,
    pub lag_48h: Option<f64>,
    pub lag_168h: Option<f64>,
    pub roll_mean_24h: Option<f64>,
    pub roll_std_24h: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Fall => "Fall",
        }
    }

    pub fn from_month_number(n: u32) -> Season {
        match n {
            1 => Season::Winter,
            2 => Season::Spring,
            3 => Season::Summer,
            4 => Season::Fall,
            _ => Season::Winter,
        }
    }

    /// Maps the season-id convention used by the calendar file
    /// (1=Winter, 2=Spring, 3=Summer, 4=Fall) to the enum.
    pub fn from_season_id(id: u32) -> Season {
        Self::from_month_number(id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarRecord {
    pub date: String,
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub month: u32,
    pub season: u32,
    pub is_school_term: bool,
    pub is_holiday: bool,
    pub holiday_win_m1: bool,
    pub holiday_win_p1: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CalendarFeatures {
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub month: u32,
    pub season: Season,
    pub is_school_term: bool,
    pub is_holiday: bool,
    pub holiday_win_m1: bool,
    pub holiday_win_p1: bool,
}

/// Running counts of which fallback tier `lags()` resolved to. Used for the
/// monotonicity property: the three counters always sum to the lookup count.
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct FallbackStats {
    pub seasonal_match: u64,
    pub hour_fallback: u64,
    pub zero_fallback: u64,
}

impl FallbackStats {
    pub fn total(&self) -> u64 {
        self.seasonal_match + self.hour_fallback + self.zero_fallback
    }

    pub fn percentages(&self) -> (f64, f64, f64) {
        let total = self.total();
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        (
            100.0 * self.seasonal_match as f64 / total as f64,
            100.0 * self.hour_fallback as f64 / total as f64,
            100.0 * self.zero_fallback as f64 / total as f64,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    Seasonal,
    Hour,
    Zero,
}
