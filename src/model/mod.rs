//! Gradient-boosted-tree inference.
//!
//! No crate in this project's dependency stack trains or scores a GBDT model,
//! and training one is explicitly out of scope here — the model is a
//! pretrained artifact produced out-of-band. This module only walks it: a
//! JSON file listing the model's trees (as binary split/leaf nodes), the
//! expected numeric feature order, and the category vocabularies for the two
//! categorical columns (`line_name`, `season`). Scoring a row is the sum of
//! the leaf value reached in each tree.

pub mod types;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::feature_store::types::LagFeatures;
use types::ModelInput;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model predicted {0} rows for a batch of {1} inputs")]
    RowCountMismatch(usize, usize),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature_index: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        value: f64,
    },
}

impl Node {
    fn score(&self, row: &[f64]) -> f64 {
        match self {
            Node::Leaf { value } => *value,
            Node::Split {
                feature_index,
                threshold,
                left,
                right,
            } => {
                let x = row.get(*feature_index).copied().unwrap_or(0.0);
                if x < *threshold {
                    left.score(row)
                } else {
                    right.score(row)
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Tree {
    root: Node,
}

#[derive(Debug, Deserialize)]
struct ModelArtifact {
    feature_names: Vec<String>,
    #[serde(default)]
    categories: HashMap<String, Vec<String>>,
    #[serde(default)]
    base_score: f64,
    trees: Vec<Tree>,
}

/// A loaded gradient-boosted-tree model, ready to score `ModelInput` rows in
/// one batched call that preserves row order.
pub struct Model {
    feature_names: Vec<String>,
    categories: HashMap<String, Vec<String>>,
    base_score: f64,
    trees: Vec<Tree>,
}

impl Model {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let artifact: ModelArtifact = serde_json::from_str(&content)?;
        Ok(Self {
            feature_names: artifact.feature_names,
            categories: artifact.categories,
            base_score: artifact.base_score,
            trees: artifact.trees,
        })
    }

    fn encode(&self, input: &ModelInput) -> Vec<f64> {
        self.feature_names
            .iter()
            .map(|name| match name.as_str() {
                "line_name" => self.category_code("line_name", &input.line_name),
                "season" => self.category_code("season", input.season.as_str()),
                "hour_of_day" => input.hour_of_day as f64,
                "day_of_week" => input.day_of_week as f64,
                "is_weekend" => bool_to_f64(input.is_weekend),
                "month" => input.month as f64,
                "is_school_term" => bool_to_f64(input.is_school_term),
                "is_holiday" => bool_to_f64(input.is_holiday),
                "holiday_win_m1" => bool_to_f64(input.holiday_win_m1),
                "holiday_win_p1" => bool_to_f64(input.holiday_win_p1),
                "temperature_2m" => input.temperature_2m,
                "precipitation" => input.precipitation,
                "wind_speed_10m" => input.wind_speed_10m,
                "lag_24h" => input.lag_24h,
                "lag_48h" => input.lag_48h,
                "lag_168h" => input.lag_168h,
                "roll_mean_24h" => input.roll_mean_24h,
                "roll_std_24h" => input.roll_std_24h,
                _ => 0.0,
            })
            .collect()
    }

    fn category_code(&self, column: &str, value: &str) -> f64 {
        match self.categories.get(column) {
            Some(values) => values
                .iter()
                .position(|v| v == value)
                .map(|i| i as f64)
                .unwrap_or(-1.0),
            None => -1.0,
        }
    }

    fn score_row(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.root.score(row)).sum::<f64>()
    }

    /// Scores a batch of rows in one call, preserving input order.
    pub fn predict_batch(&self, inputs: &[ModelInput]) -> Vec<f64> {
        inputs
            .iter()
            .map(|input| self.score_row(&self.encode(input)))
            .collect()
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub fn zero_lags() -> LagFeatures {
    LagFeatures::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::types::Season;
    use std::io::Write;

    fn sample_input() -> ModelInput {
        ModelInput {
            line_name: "34".into(),
            hour_of_day: 8,
            day_of_week: 1,
            is_weekend: false,
            month: 11,
            season: Season::Fall,
            is_school_term: true,
            is_holiday: false,
            holiday_win_m1: false,
            holiday_win_p1: false,
            temperature_2m: 15.0,
            precipitation: 0.0,
            wind_speed_10m: 5.0,
            lag_24h: 10.0,
            lag_48h: 9.0,
            lag_168h: 8.0,
            roll_mean_24h: 9.5,
            roll_std_24h: 1.0,
        }
    }

    #[test]
    fn single_leaf_tree_returns_constant() {
        let dir = std::env::temp_dir().join(format!("model_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        let artifact = serde_json::json!({
            "feature_names": ["lag_24h"],
            "categories": {},
            "base_score": 1.0,
            "trees": [{"root": {"kind": "leaf", "value": 5.0}}]
        });
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(artifact.to_string().as_bytes()).unwrap();

        let model = Model::load(&path).unwrap();
        let predictions = model.predict_batch(&[sample_input()]);
        assert_eq!(predictions, vec![6.0]);
    }

    #[test]
    fn split_node_routes_on_threshold() {
        let dir = std::env::temp_dir().join(format!("model_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        let artifact = serde_json::json!({
            "feature_names": ["lag_24h"],
            "categories": {},
            "base_score": 0.0,
            "trees": [{
                "root": {
                    "kind": "split",
                    "feature_index": 0,
                    "threshold": 5.0,
                    "left": {"kind": "leaf", "value": -1.0},
                    "right": {"kind": "leaf", "value": 1.0}
                }
            }]
        });
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(artifact.to_string().as_bytes()).unwrap();

        let model = Model::load(&path).unwrap();
        let predictions = model.predict_batch(&[sample_input()]);
        assert_eq!(predictions, vec![1.0]);
    }
}
