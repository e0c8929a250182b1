//! Algorithm interface
//!
//! One method per pipeline stage, each taking its own parameter struct. The
//! drivers assemble the parameters; nothing is shared between stages except
//! through the algorithm's own state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::checkpoint::Checkpointable;
use crate::error::{HarnessError, HarnessResult};
use crate::feedback::FeedbackClient;
use crate::metadata::TestMetadata;
use crate::types::{ResultType, Stage};

/// Per-instance features and logits produced by feature extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundFeatures {
    #[serde(rename = "features_dict")]
    pub features: BTreeMap<String, Vec<f64>>,
    #[serde(rename = "logit_dict")]
    pub logits: BTreeMap<String, Vec<f64>>,
}

impl RoundFeatures {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.logits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Add every instance of `other`, replacing known ids
    pub fn extend(&mut self, other: RoundFeatures) {
        self.features.extend(other.features);
        self.logits.extend(other.logits);
    }

    /// Features for `ids` when every id is known
    pub fn select(&self, ids: &[String]) -> Option<RoundFeatures> {
        let mut selected = RoundFeatures::default();
        for id in ids {
            selected.features.insert(id.clone(), self.features.get(id)?.clone());
            selected.logits.insert(id.clone(), self.logits.get(id)?.clone());
        }
        Some(selected)
    }
}

pub struct InitializeParams<'a> {
    pub session_id: &'a str,
    pub test_id: &'a str,
    pub parameters: &'a Map<String, Value>,
    pub metadata: &'a TestMetadata,
    /// Budgeted feedback access, absent when feedback is disabled
    pub feedback: Option<FeedbackClient>,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractionParams<'a> {
    /// Round file as delivered by the harness
    pub dataset: &'a Path,
    pub ids: &'a [String],
    pub round_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WorldDetectionParams<'a> {
    pub features: &'a RoundFeatures,
    pub ids: &'a [String],
    pub round_id: u32,
    /// Instance where the world changes, when the session may see it
    pub red_light: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct NoveltyClassificationParams<'a> {
    pub features: &'a RoundFeatures,
    pub ids: &'a [String],
    pub round_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NoveltyAdaptationParams {
    pub round_id: u32,
}

/// Characterization input: one round, or the whole test when `round_id` is `None`
#[derive(Debug, Clone, Copy)]
pub struct NoveltyCharacterizationParams<'a> {
    pub features: &'a RoundFeatures,
    pub ids: &'a [String],
    pub round_id: Option<u32>,
}

/// A novelty detection algorithm driven by the round protocols.
///
/// Result-producing stages return CSV content (`id,value...` rows).
/// Stages an algorithm does not support keep their default bodies; the
/// drivers only call them when they are not skipped.
pub trait NoveltyAlgorithm: Checkpointable + Send {
    fn initialize(&mut self, params: InitializeParams<'_>) -> HarnessResult<()>;

    fn feature_extraction(&mut self, params: &FeatureExtractionParams<'_>) -> HarnessResult<RoundFeatures>;

    fn world_detection(&mut self, params: &WorldDetectionParams<'_>) -> HarnessResult<String>;

    fn novelty_classification(&mut self, _params: &NoveltyClassificationParams<'_>) -> HarnessResult<String> {
        Err(unsupported(Stage::NoveltyClassification))
    }

    fn novelty_adaptation(&mut self, _params: &NoveltyAdaptationParams) -> HarnessResult<()> {
        Ok(())
    }

    /// Results keyed by type. An empty map posts nothing.
    fn novelty_characterization(
        &mut self,
        _params: &NoveltyCharacterizationParams<'_>,
    ) -> HarnessResult<BTreeMap<ResultType, String>> {
        Err(unsupported(Stage::NoveltyCharacterization))
    }
}

fn unsupported(stage: Stage) -> HarnessError {
    HarnessError::not_implemented(format!("{stage} is not supported by this algorithm"))
}
