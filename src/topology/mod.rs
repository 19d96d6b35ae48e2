//! Static network topology: stations, per-line station ordering, and
//! per-direction first/last service times. Loaded once from a JSON file at
//! startup; read-only thereafter (administrative reload swaps the handle).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read topology file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse topology file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Station {
    pub station_id: String,
    pub name: String,
    pub order: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Direction {
    pub direction_id: String,
    /// "HH:MM", may be on the other side of midnight from `last_time`.
    pub first_time: String,
    pub last_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineTopology {
    pub stations: Vec<Station>,
    pub directions: Vec<Direction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    lines: HashMap<String, LineTopology>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let topology: Topology = serde_json::from_str(&content)?;
        Ok(topology)
    }

    pub fn line(&self, code: &str) -> Option<&LineTopology> {
        self.lines.get(code)
    }

    pub fn line_codes(&self) -> impl Iterator<Item = &String> {
        self.lines.keys()
    }

    /// Termini (first, last) ordered by `Station::order`. Used both by the
    /// forecast API's rail service-hour derivation and by the metro cache's
    /// trips-per-hour projection.
    pub fn termini<'a>(&'a self, code: &str) -> Option<(&'a Station, &'a Station)> {
        let line = self.lines.get(code)?;
        if line.stations.is_empty() {
            return None;
        }
        let mut sorted: Vec<&Station> = line.stations.iter().collect();
        sorted.sort_by_key(|s| s.order);
        Some((sorted[0], sorted[sorted.len() - 1]))
    }

    /// Looks up a station's display name by (line, station_id). Used to
    /// label Rail Schedule Cache rows, since the upstream timetable response
    /// itself carries no station/direction name fields.
    pub fn station_name(&self, line_code: &str, station_id: &str) -> Option<&str> {
        self.lines
            .get(line_code)?
            .stations
            .iter()
            .find(|s| s.station_id == station_id)
            .map(|s| s.name.as_str())
    }

    /// All (station_id, direction_id) pairs exposed on a line; the Rail
    /// Schedule Cache enumerates its prefetch universe from this.
    pub fn station_direction_pairs(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for (code, line) in &self.lines {
            for station in &line.stations {
                for direction in &line.directions {
                    out.push((station.station_id.clone(), direction.direction_id.clone(), code.clone()));
                }
            }
        }
        out
    }
}

/// Resolves `M1A`/`M1B` to the shared `M1` line code used for forecast
/// lookups; schedule/topology calls keep the original code.
pub fn resolve_forecast_alias(line_code: &str) -> &str {
    match line_code {
        "M1A" | "M1B" => "M1",
        other => other,
    }
}

/// Branches that should be pooled when projecting metro trips-per-hour for a
/// requested line code.
pub fn branches_for(line_code: &str) -> Vec<&str> {
    match line_code {
        "M1" => vec!["M1A", "M1B"],
        other => vec![other],
    }
}

pub fn is_rail_code(line_code: &str) -> bool {
    line_code.starts_with('M') || line_code.starts_with('F') || line_code.starts_with('T')
}

pub const MARMARAY_FIRST_TIME: &str = "06:00";
pub const MARMARAY_LAST_TIME: &str = "00:00";

pub fn is_marmaray(line_code: &str) -> bool {
    line_code.eq_ignore_ascii_case("marmaray")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn m1_branches_pool_a_and_b() {
        assert_eq!(branches_for("M1"), vec!["M1A", "M1B"]);
        assert_eq!(branches_for("M2"), vec!["M2"]);
    }

    #[test]
    fn forecast_alias_resolves_m1_branches() {
        assert_eq!(resolve_forecast_alias("M1A"), "M1");
        assert_eq!(resolve_forecast_alias("M1B"), "M1");
        assert_eq!(resolve_forecast_alias("M2"), "M2");
    }
}
