//! Feature cache
//!
//! Features extracted during a test are aggregated across rounds and saved
//! once the test completes. A later run can restore them and skip feature
//! extraction for ids it has already seen.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::algorithm::RoundFeatures;
use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSettings {
    /// Directory of feature files, or a single feature file
    #[serde(default)]
    pub feature_dir: PathBuf,
    #[serde(default)]
    pub use_saved_features: bool,
    /// Read `<algorithm>_features.json` instead of the per-test file
    #[serde(default)]
    pub use_consolidated_features: bool,
}

/// `<dir>/<test>_<algorithm>_features.json`
pub fn feature_path(dir: &Path, test_id: &str, algorithm: &str) -> PathBuf {
    dir.join(format!("{test_id}_{algorithm}_features.json"))
}

/// Features saved by an earlier run, or nothing when reuse is disabled
pub fn restore_features(
    settings: &FeatureSettings,
    test_id: &str,
    algorithm: &str,
) -> HarnessResult<RoundFeatures> {
    if !settings.use_saved_features {
        return Ok(RoundFeatures::default());
    }

    let dir = &settings.feature_dir;
    let path = if !dir.is_dir() {
        dir.clone()
    } else if settings.use_consolidated_features {
        dir.join(format!("{algorithm}_features.json"))
    } else {
        feature_path(dir, test_id, algorithm)
    };

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        HarnessError::config(format!("Cannot read saved features at {}: {e}", path.display()))
    })?;
    let features: RoundFeatures = serde_json::from_str(&raw)?;
    info!(test_id, algorithm, instances = features.len(), path = %path.display(), "Restored features");
    Ok(features)
}

pub fn save_features(
    dir: &Path,
    test_id: &str,
    algorithm: &str,
    features: &RoundFeatures,
) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = feature_path(dir, test_id, algorithm);
    info!(path = %path.display(), "Saving features");
    let json = serde_json::to_string_pretty(features)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
