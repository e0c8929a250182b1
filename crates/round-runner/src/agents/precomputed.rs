//! Precomputed algorithm
//!
//! Replays results computed offline. For each test and result type it reads
//! either a per-round file (`<dir>/<test>/round_<n>_<type>.csv`) or a
//! per-test file (`<dir>/<test>_<type>.csv`) whose rows are filtered to the
//! round's ids.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use round_harness::checkpoint::Checkpointable;
use round_harness::error::{HarnessError, HarnessResult};
use round_harness::protocol::{
    FeatureExtractionParams, InitializeParams, NoveltyAlgorithm, NoveltyCharacterizationParams,
    NoveltyClassificationParams, RoundFeatures, WorldDetectionParams,
};
use round_harness::ResultType;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AlgorithmConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrecomputedParameters {
    pub results_dir: PathBuf,
}

pub struct PrecomputedAlgorithm {
    results_dir: PathBuf,
    test_id: String,
    cached_features: RoundFeatures,
}

pub fn build(config: &AlgorithmConfig) -> Result<Box<dyn NoveltyAlgorithm>> {
    let params: PrecomputedParameters =
        serde_json::from_value(Value::Object(config.parameters.clone()))
            .context(format!("Invalid parameters for precomputed algorithm {}", config.name))?;
    Ok(Box::new(PrecomputedAlgorithm::new(params.results_dir)))
}

impl PrecomputedAlgorithm {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            test_id: String::new(),
            cached_features: RoundFeatures::default(),
        }
    }

    fn round_file(&self, round_id: u32, result_type: ResultType) -> PathBuf {
        self.results_dir
            .join(&self.test_id)
            .join(format!("round_{round_id}_{result_type}.csv"))
    }

    fn test_file(&self, result_type: ResultType) -> PathBuf {
        self.results_dir
            .join(format!("{}_{result_type}.csv", self.test_id))
    }

    /// Cached rows for a round, or for the whole test when `round_id` is `None`
    pub fn lookup(
        &self,
        result_type: ResultType,
        round_id: Option<u32>,
        ids: &[String],
    ) -> HarnessResult<String> {
        if let Some(round_id) = round_id {
            let path = self.round_file(round_id, result_type);
            if path.exists() {
                debug!(path = %path.display(), "Serving per-round results");
                return Ok(std::fs::read_to_string(path)?);
            }
        }

        let path = self.test_file(result_type);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            HarnessError::config(format!(
                "No cached {result_type} results for test {} at {}: {e}",
                self.test_id,
                path.display()
            ))
        })?;
        if round_id.is_none() {
            return Ok(raw);
        }
        Ok(filter_rows(&raw, ids))
    }
}

/// Keep the lines whose first field is one of `ids`
fn filter_rows(raw: &str, ids: &[String]) -> String {
    raw.lines()
        .filter(|line| {
            line.split(',')
                .next()
                .is_some_and(|id| ids.iter().any(|wanted| wanted == id.trim()))
        })
        .map(|line| format!("{line}\n"))
        .collect()
}

fn load_features(path: &Path) -> HarnessResult<RoundFeatures> {
    if !path.exists() {
        return Ok(RoundFeatures::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

impl Checkpointable for PrecomputedAlgorithm {}

impl NoveltyAlgorithm for PrecomputedAlgorithm {
    fn initialize(&mut self, params: InitializeParams<'_>) -> HarnessResult<()> {
        self.test_id = params.test_id.to_string();
        let path = self.results_dir.join(format!("{}_features.json", self.test_id));
        self.cached_features = load_features(&path)?;
        info!(
            test_id = %self.test_id,
            cached = self.cached_features.len(),
            "Precomputed results ready"
        );
        Ok(())
    }

    fn feature_extraction(&mut self, params: &FeatureExtractionParams<'_>) -> HarnessResult<RoundFeatures> {
        if let Some(features) = self.cached_features.select(params.ids) {
            return Ok(features);
        }
        let mut features = RoundFeatures::default();
        for id in params.ids {
            features.features.insert(id.clone(), Vec::new());
            features.logits.insert(id.clone(), Vec::new());
        }
        Ok(features)
    }

    fn world_detection(&mut self, params: &WorldDetectionParams<'_>) -> HarnessResult<String> {
        self.lookup(ResultType::Detection, Some(params.round_id), params.ids)
    }

    fn novelty_classification(&mut self, params: &NoveltyClassificationParams<'_>) -> HarnessResult<String> {
        self.lookup(ResultType::Classification, Some(params.round_id), params.ids)
    }

    fn novelty_characterization(
        &mut self,
        params: &NoveltyCharacterizationParams<'_>,
    ) -> HarnessResult<BTreeMap<ResultType, String>> {
        let rows = self.lookup(ResultType::Characterization, params.round_id, params.ids)?;
        if rows.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(BTreeMap::from([(ResultType::Characterization, rows)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn algorithm(dir: &Path) -> PrecomputedAlgorithm {
        let mut alg = PrecomputedAlgorithm::new(dir);
        alg.test_id = "OND.1.1.1234".into();
        alg
    }

    #[test]
    fn test_per_test_file_filtered_to_round() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("OND.1.1.1234_detection.csv"),
            "a.png,0.1\nb.png,0.2\nc.png,0.9\n",
        )
        .unwrap();
        let alg = algorithm(dir.path());

        let rows = alg
            .lookup(ResultType::Detection, Some(1), &ids(&["c.png"]))
            .unwrap();
        assert_eq!(rows, "c.png,0.9\n");

        let all = alg.lookup(ResultType::Detection, None, &[]).unwrap();
        assert_eq!(all.lines().count(), 3);
    }

    #[test]
    fn test_per_round_file_wins() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("OND.1.1.1234")).unwrap();
        std::fs::write(
            dir.path().join("OND.1.1.1234").join("round_0_classification.csv"),
            "a.png,1,0\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("OND.1.1.1234_classification.csv"),
            "a.png,0,1\n",
        )
        .unwrap();
        let alg = algorithm(dir.path());
        let rows = alg
            .lookup(ResultType::Classification, Some(0), &ids(&["a.png"]))
            .unwrap();
        assert_eq!(rows, "a.png,1,0\n");
    }

    #[test]
    fn test_missing_cache_is_a_config_error() {
        let dir = tempdir().unwrap();
        let alg = algorithm(dir.path());
        let err = alg
            .lookup(ResultType::Detection, Some(0), &ids(&["a.png"]))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }));
    }

    #[test]
    fn test_build_requires_results_dir() {
        let config = AlgorithmConfig {
            name: "cached".into(),
            kind: "precomputed".into(),
            detection_threshold: 0.5,
            version: None,
            parameters: serde_json::Map::new(),
        };
        assert!(build(&config).is_err());
    }
}
