//! Shared fixtures: a seeded data directory and a recording algorithm.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use round_harness::checkpoint::{AttributeValue, Checkpointable};
use round_harness::error::HarnessResult;
use round_harness::feedback::FeedbackClient;
use round_harness::protocol::{
    FeatureExtractionParams, InitializeParams, NoveltyAdaptationParams, NoveltyAlgorithm,
    NoveltyCharacterizationParams, NoveltyClassificationParams, RoundFeatures,
    WorldDetectionParams,
};
use round_harness::ResultType;
use serde_json::Value;

pub const IMAGE_TESTS: [&str; 2] = ["OND.1.1.1234", "OND.1.2.1234"];

/// Five images per test, two per round: rounds of 2, 2 and 1
pub fn seed_images(data: &Path, protocol: &str) {
    let base = data.join(protocol).join("image_classification");
    std::fs::create_dir_all(&base).unwrap();
    for test in IMAGE_TESTS {
        std::fs::write(
            base.join(format!("{test}_single_df.csv")),
            "image_path,novel,class\n\
             a.png,0,1\n\
             b.png,0,2\n\
             c.png,1,7\n\
             d.png,1,8\n\
             e.png,1,9\n",
        )
        .unwrap();
        std::fs::write(
            base.join(format!("{test}_metadata.json")),
            r#"{"protocol": "OND", "round_size": 2, "feedback_max_ids": 1,
                "known_classes": 5, "red_light": "c.png", "secret": 1}"#,
        )
        .unwrap();
    }
}

/// Calls made on a [`Recorder`], shared with the test body
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Algorithm that declares novelty everywhere and logs every call
pub struct Recorder {
    journal: Journal,
    feedback: Option<FeedbackClient>,
    round_ids: Vec<String>,
    seen: Vec<Value>,
}

impl Recorder {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            feedback: None,
            round_ids: Vec::new(),
            seen: Vec::new(),
        }
    }
}

impl Checkpointable for Recorder {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        (name == "seen").then(|| {
            AttributeValue::Sequence(self.round_ids.iter().map(|id| Value::from(id.as_str())).collect())
        })
    }

    fn set_attribute(&mut self, name: &str, value: AttributeValue) -> HarnessResult<()> {
        if let AttributeValue::Sequence(values) = value {
            self.journal.push(format!("restore:{name}:{}", values.len()));
            self.seen = values;
        }
        Ok(())
    }
}

impl NoveltyAlgorithm for Recorder {
    fn initialize(&mut self, params: InitializeParams<'_>) -> HarnessResult<()> {
        self.journal.push(format!(
            "initialize:{}:{}",
            params.test_id,
            params.metadata.contains("secret")
        ));
        self.feedback = params.feedback;
        Ok(())
    }

    fn feature_extraction(&mut self, params: &FeatureExtractionParams<'_>) -> HarnessResult<RoundFeatures> {
        self.journal.push(format!("features:{}", params.round_id));
        let from_file = std::fs::read_to_string(params.dataset)?;
        assert_eq!(from_file.lines().count(), params.ids.len());
        self.round_ids = params.ids.to_vec();

        let mut features = RoundFeatures::default();
        for id in params.ids {
            features.features.insert(id.clone(), vec![1.0, 0.0]);
            features.logits.insert(id.clone(), vec![0.2, 0.8]);
        }
        Ok(features)
    }

    fn world_detection(&mut self, params: &WorldDetectionParams<'_>) -> HarnessResult<String> {
        self.journal.push(format!(
            "detection:{}:{}",
            params.round_id,
            params.red_light.unwrap_or("-")
        ));
        Ok(params.ids.iter().map(|id| format!("{id},0.9\n")).collect())
    }

    fn novelty_classification(&mut self, params: &NoveltyClassificationParams<'_>) -> HarnessResult<String> {
        self.journal.push(format!("classification:{}", params.round_id));
        Ok(params
            .ids
            .iter()
            .map(|id| format!("{id},0.1,0.9\n"))
            .collect())
    }

    fn novelty_adaptation(&mut self, params: &NoveltyAdaptationParams) -> HarnessResult<()> {
        if let Some(client) = self.feedback.as_mut() {
            let rows = client.request(params.round_id, &self.round_ids)?;
            let served = rows.map_or(0, |rows| rows.len());
            self.journal
                .push(format!("adaptation:{}:{served}", params.round_id));
        } else {
            self.journal.push(format!("adaptation:{}:none", params.round_id));
        }
        Ok(())
    }

    fn novelty_characterization(
        &mut self,
        params: &NoveltyCharacterizationParams<'_>,
    ) -> HarnessResult<BTreeMap<ResultType, String>> {
        let round = params.round_id.map_or("all".to_string(), |r| r.to_string());
        self.journal.push(format!(
            "characterization:{round}:{}:{}",
            params.ids.len(),
            params.features.len()
        ));
        let content = params.ids.iter().map(|id| format!("{id},1\n")).collect();
        Ok(BTreeMap::from([(ResultType::Characterization, content)]))
    }
}
