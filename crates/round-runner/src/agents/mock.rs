//! Mock algorithm
//!
//! Echoes the round's ids back as results with fixed scores and records
//! every call it receives. Useful for smoke-testing a harness deployment
//! without a model.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use round_harness::checkpoint::{AttributeValue, Checkpointable};
use round_harness::error::HarnessResult;
use round_harness::feedback::FeedbackClient;
use round_harness::protocol::{
    FeatureExtractionParams, InitializeParams, NoveltyAdaptationParams, NoveltyAlgorithm,
    NoveltyCharacterizationParams, NoveltyClassificationParams, RoundFeatures,
    WorldDetectionParams,
};
use round_harness::ResultType;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::AlgorithmConfig;

fn default_detection_score() -> f64 {
    0.9
}

fn default_classes() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MockParameters {
    /// Score reported for every instance in world detection
    #[serde(default = "default_detection_score")]
    pub detection_score: f64,
    /// Width of the classification rows
    #[serde(default = "default_classes")]
    pub classes: usize,
    /// Ask for feedback on the round's ids during adaptation
    #[serde(default = "default_true")]
    pub request_feedback: bool,
}

impl Default for MockParameters {
    fn default() -> Self {
        Self {
            detection_score: default_detection_score(),
            classes: default_classes(),
            request_feedback: true,
        }
    }
}

impl MockParameters {
    pub fn from_map(parameters: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(parameters.clone()))
            .context("Invalid mock algorithm parameters")
    }
}

/// Shared record of the calls a [`MockAlgorithm`] received
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct MockAlgorithm {
    params: MockParameters,
    calls: CallLog,
    feedback: Option<FeedbackClient>,
    round_ids: Vec<String>,
    feedback_received: usize,
}

impl MockAlgorithm {
    pub fn new(params: MockParameters) -> Self {
        Self {
            params,
            calls: CallLog::default(),
            feedback: None,
            round_ids: Vec::new(),
            feedback_received: 0,
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn feedback_received(&self) -> usize {
        self.feedback_received
    }

    fn record(&self, call: String) {
        debug!(call = %call, "mock call");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn rows(ids: &[String], values: &str) -> String {
        ids.iter().map(|id| format!("{id},{values}\n")).collect()
    }
}

/// Registry entry point
pub fn build(config: &AlgorithmConfig) -> Result<Box<dyn NoveltyAlgorithm>> {
    let params = MockParameters::from_map(&config.parameters)?;
    Ok(Box::new(MockAlgorithm::new(params)))
}

impl Checkpointable for MockAlgorithm {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "round_ids" => Some(AttributeValue::Sequence(
                self.round_ids.iter().map(|id| Value::from(id.as_str())).collect(),
            )),
            "feedback_received" => Some(AttributeValue::Scalar(Value::from(self.feedback_received))),
            _ => None,
        }
    }

    fn set_attribute(&mut self, name: &str, value: AttributeValue) -> HarnessResult<()> {
        self.record(format!("set_attribute:{name}:{}", value.kind()));
        match (name, value) {
            ("round_ids", AttributeValue::Sequence(values)) => {
                self.round_ids = values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
            ("feedback_received", AttributeValue::Scalar(v)) => {
                self.feedback_received = v.as_u64().unwrap_or(0) as usize;
            }
            _ => {}
        }
        Ok(())
    }
}

impl NoveltyAlgorithm for MockAlgorithm {
    fn initialize(&mut self, params: InitializeParams<'_>) -> HarnessResult<()> {
        self.record(format!("initialize:{}", params.test_id));
        self.feedback = params.feedback;
        self.round_ids.clear();
        self.feedback_received = 0;
        Ok(())
    }

    fn feature_extraction(&mut self, params: &FeatureExtractionParams<'_>) -> HarnessResult<RoundFeatures> {
        self.record(format!("feature_extraction:{}", params.round_id));
        self.round_ids = params.ids.to_vec();
        let mut features = RoundFeatures::default();
        let uniform = 1.0 / self.params.classes.max(1) as f64;
        for id in params.ids {
            features.features.insert(id.clone(), vec![0.0]);
            features
                .logits
                .insert(id.clone(), vec![uniform; self.params.classes.max(1)]);
        }
        Ok(features)
    }

    fn world_detection(&mut self, params: &WorldDetectionParams<'_>) -> HarnessResult<String> {
        self.record(format!("world_detection:{}", params.round_id));
        Ok(Self::rows(params.ids, &self.params.detection_score.to_string()))
    }

    fn novelty_classification(&mut self, params: &NoveltyClassificationParams<'_>) -> HarnessResult<String> {
        self.record(format!("novelty_classification:{}", params.round_id));
        let mut one_hot = vec!["0"; self.params.classes.max(1)];
        one_hot[0] = "1";
        Ok(Self::rows(params.ids, &one_hot.join(",")))
    }

    fn novelty_adaptation(&mut self, params: &NoveltyAdaptationParams) -> HarnessResult<()> {
        self.record(format!("novelty_adaptation:{}", params.round_id));
        if !self.params.request_feedback {
            return Ok(());
        }
        if let Some(client) = self.feedback.as_mut() {
            if let Some(rows) = client.request(params.round_id, &self.round_ids)? {
                self.feedback_received += rows.len();
            }
        }
        Ok(())
    }

    fn novelty_characterization(
        &mut self,
        params: &NoveltyCharacterizationParams<'_>,
    ) -> HarnessResult<BTreeMap<ResultType, String>> {
        let round = params
            .round_id
            .map_or_else(|| "test".to_string(), |r| r.to_string());
        self.record(format!("novelty_characterization:{round}"));
        Ok(BTreeMap::from([(
            ResultType::Characterization,
            Self::rows(params.ids, "1"),
        )]))
    }
}
