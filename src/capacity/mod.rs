//! Capacity Store: per-line vehicle-capacity metadata used as a fallback when
//! the Feature Store has no observed `max_y` for a line (new lines, or rail
//! lines intentionally overridden by a static table).
//!
//! Resolution order, confirmed against the original implementation: a static
//! rail-override YAML wins over the CSV-derived representative-vehicle table
//! when both exist for the same line (see DESIGN.md, Open Question 3).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse yaml override: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse csv row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum Confidence {
    Static,
    Representative,
    Fallback,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CapacityMeta {
    pub line_code: String,
    pub expected_capacity_weighted: i64,
    pub capacity_min: Option<i64>,
    pub capacity_max: Option<i64>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Deserialize)]
struct CapacityMetaRecord {
    line_code: String,
    expected_capacity_weighted: i64,
    capacity_min: Option<i64>,
    capacity_max: Option<i64>,
}

pub struct CapacityStore {
    rail_static: HashMap<String, i64>,
    representative: HashMap<String, CapacityMetaRecord>,
    vehicle_capacity_fallback: i64,
}

impl CapacityStore {
    pub fn load(
        capacity_meta_csv: Option<&Path>,
        rail_capacity_yaml: Option<&Path>,
        vehicle_capacity_fallback: i64,
    ) -> Result<Self, Error> {
        let rail_static = match rail_capacity_yaml {
            Some(path) => load_rail_overrides(path)?,
            None => HashMap::new(),
        };

        let representative = match capacity_meta_csv {
            Some(path) => load_representative(path)?,
            None => HashMap::new(),
        };

        Ok(Self {
            rail_static,
            representative,
            vehicle_capacity_fallback,
        })
    }

    pub fn get(&self, line_code: &str) -> CapacityMeta {
        let resolved = crate::topology::resolve_forecast_alias(line_code);

        if let Some(&capacity) = self.rail_static.get(resolved) {
            return CapacityMeta {
                line_code: resolved.to_string(),
                expected_capacity_weighted: capacity,
                capacity_min: None,
                capacity_max: None,
                confidence: Confidence::Static,
            };
        }

        if let Some(record) = self.representative.get(resolved) {
            return CapacityMeta {
                line_code: resolved.to_string(),
                expected_capacity_weighted: record.expected_capacity_weighted,
                capacity_min: record.capacity_min,
                capacity_max: record.capacity_max,
                confidence: Confidence::Representative,
            };
        }

        CapacityMeta {
            line_code: resolved.to_string(),
            expected_capacity_weighted: self.vehicle_capacity_fallback,
            capacity_min: None,
            capacity_max: None,
            confidence: Confidence::Fallback,
        }
    }
}

fn load_rail_overrides(path: &Path) -> Result<HashMap<String, i64>, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)?;
    let mut out = HashMap::new();
    for (line_code, value) in raw {
        let parsed = match value {
            serde_yaml::Value::Number(n) => n.as_i64(),
            serde_yaml::Value::String(s) => s.replace(',', "").trim().parse::<i64>().ok(),
            _ => None,
        };
        if let Some(capacity) = parsed {
            out.insert(line_code, capacity);
        }
    }
    Ok(out)
}

fn load_representative(path: &Path) -> Result<HashMap<String, CapacityMetaRecord>, Error> {
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
    let mut out = HashMap::new();
    for result in reader.deserialize::<CapacityMetaRecord>() {
        let record = result?;
        out.insert(record.line_code.clone(), record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_override_wins_over_representative_table() {
        let dir = std::env::temp_dir().join(format!("cap_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let yaml_path = dir.join("rail_capacity.yaml");
        std::fs::write(&yaml_path, "M2: 1200\n").unwrap();

        let csv_path = dir.join("capacity_meta.csv");
        std::fs::write(
            &csv_path,
            "line_code,expected_capacity_weighted,capacity_min,capacity_max\nM2,900,800,1000\n",
        )
        .unwrap();

        let store = CapacityStore::load(Some(&csv_path), Some(&yaml_path), 100).unwrap();
        let meta = store.get("M2");
        assert_eq!(meta.expected_capacity_weighted, 1200);
        assert_eq!(meta.confidence, Confidence::Static);
    }

    #[test]
    fn missing_line_falls_back_to_default() {
        let store = CapacityStore::load(None, None, 100).unwrap();
        let meta = store.get("999");
        assert_eq!(meta.expected_capacity_weighted, 100);
        assert_eq!(meta.confidence, Confidence::Fallback);
    }
}
