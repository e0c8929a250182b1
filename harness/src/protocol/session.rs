//! Session orchestration
//!
//! Creates (or resumes) one session per algorithm, drives every test of the
//! session through the configured protocol variant and terminates the
//! sessions at the end of the run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::algorithm::NoveltyAlgorithm;
use super::condda::Condda;
use super::features::FeatureSettings;
use super::ond::Ond;
use super::round::{RoundProtocol, TestDriver, TestOutcome};
use crate::checkpoint::{CheckpointConfig, CheckpointStore};
use crate::error::{HarnessError, HarnessResult};
use crate::harness::{read_test_ids, EvaluationHarness};
use crate::lifecycle::SessionRequest;
use crate::types::{FeedbackType, ProtocolKind, Stage};

const DEFAULT_VERSION: &str = "0.0.1";

fn default_feedback_type() -> FeedbackType {
    FeedbackType::Classification
}

/// Protocol-level run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(rename = "name")]
    pub protocol: ProtocolKind,
    pub domain: String,
    /// Explicit test ids; take precedence over `test_ids_file`
    #[serde(default)]
    pub test_ids: Vec<String>,
    #[serde(default)]
    pub test_ids_file: Option<PathBuf>,
    /// Seed used to request test ids from the harness when none are given
    #[serde(default)]
    pub detector_seed: Option<String>,
    #[serde(default)]
    pub test_assumptions: Option<PathBuf>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub skip_stages: BTreeSet<Stage>,
    #[serde(default)]
    pub use_feedback: bool,
    #[serde(default = "default_feedback_type")]
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub feature_extraction_only: bool,
    /// Requires `feature_dir`
    #[serde(default)]
    pub save_features: bool,
    #[serde(flatten)]
    pub features: FeatureSettings,
    #[serde(flatten)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub resume_session: bool,
    /// Algorithm name → session id to resume
    #[serde(default)]
    pub resume_session_ids: BTreeMap<String, String>,
}

impl ProtocolConfig {
    pub fn new(protocol: ProtocolKind, domain: impl Into<String>) -> Self {
        Self {
            protocol,
            domain: domain.into(),
            test_ids: Vec::new(),
            test_ids_file: None,
            detector_seed: None,
            test_assumptions: None,
            hints: Vec::new(),
            skip_stages: BTreeSet::new(),
            use_feedback: false,
            feedback_type: default_feedback_type(),
            feature_extraction_only: false,
            save_features: false,
            features: FeatureSettings::default(),
            checkpoint: CheckpointConfig::default(),
            resume_session: false,
            resume_session_ids: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.save_features && self.features.feature_dir.as_os_str().is_empty() {
            return Err(HarnessError::config(
                "save_features is set but feature_dir is empty",
            ));
        }
        Ok(())
    }

    /// Configured skip set plus the stages implied by the run flags
    pub fn effective_skip_stages(&self) -> BTreeSet<Stage> {
        let mut skip = self.skip_stages.clone();
        if !self.save_features {
            skip.insert(Stage::SaveFeatures);
        }
        match self.protocol {
            ProtocolKind::Ond => {
                if !self.use_feedback {
                    skip.extend([Stage::CreateFeedbackInstance, Stage::NoveltyAdaptation]);
                }
                if self.feature_extraction_only {
                    skip.extend([
                        Stage::CreateFeedbackInstance,
                        Stage::WorldDetection,
                        Stage::NoveltyClassification,
                        Stage::NoveltyAdaptation,
                        Stage::NoveltyCharacterization,
                    ]);
                }
            }
            ProtocolKind::Condda => {
                if self.feature_extraction_only {
                    skip.extend([Stage::WorldDetection, Stage::NoveltyCharacterization]);
                }
            }
        }
        skip
    }

    /// Test ids from the config, a test id file, or the harness
    pub fn resolve_test_ids(&self, harness: &dyn EvaluationHarness) -> HarnessResult<Vec<String>> {
        if !self.test_ids.is_empty() {
            return Ok(self.test_ids.clone());
        }
        if let Some(path) = &self.test_ids_file {
            return read_test_ids(path);
        }
        let Some(seed) = self.detector_seed.as_deref() else {
            return Err(HarnessError::config(
                "No test ids: set test_ids, test_ids_file or detector_seed",
            ));
        };
        let path = harness.test_ids_request(
            self.protocol.as_str(),
            &self.domain,
            seed,
            self.test_assumptions.as_deref(),
        )?;
        info!(path = %path.display(), "Received test ids");
        read_test_ids(&path)
    }
}

/// Identity and session bookkeeping for one algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmAttributes {
    pub name: String,
    pub detection_threshold: f64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub test_ids: Vec<String>,
}

impl AlgorithmAttributes {
    pub fn new(name: impl Into<String>, detection_threshold: f64) -> Self {
        Self {
            name: name.into(),
            detection_threshold,
            version: None,
            parameters: Map::new(),
            session_id: None,
            test_ids: Vec::new(),
        }
    }

    /// `name-version`, with a default version when none is known
    pub fn named_version(&self) -> String {
        let version = self.version.as_deref().unwrap_or_else(|| {
            warn!(algorithm = %self.name, "No version for the algorithm, using {DEFAULT_VERSION}");
            DEFAULT_VERSION
        });
        format!("{}-{}", self.name, version)
    }

    /// Drop tests already finished in the session, keeping order
    pub fn remove_completed_tests(&mut self, finished: &[String]) {
        let finished: BTreeSet<&str> = finished.iter().map(String::as_str).collect();
        self.test_ids.retain(|t| !finished.contains(t.as_str()));
    }
}

/// An algorithm ready to run, paired with its attributes
pub struct RegisteredAlgorithm {
    pub attributes: AlgorithmAttributes,
    pub algorithm: Box<dyn NoveltyAlgorithm>,
}

impl RegisteredAlgorithm {
    pub fn new(attributes: AlgorithmAttributes, algorithm: Box<dyn NoveltyAlgorithm>) -> Self {
        Self {
            attributes,
            algorithm,
        }
    }
}

/// Per-algorithm result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmReport {
    pub name: String,
    pub session_id: String,
    pub tests: Vec<TestOutcome>,
}

impl AlgorithmReport {
    pub fn rounds(&self) -> u32 {
        self.tests.iter().map(|t| t.rounds).sum()
    }
}

pub struct ProtocolRunner {
    harness: Arc<dyn EvaluationHarness>,
    config: ProtocolConfig,
}

impl ProtocolRunner {
    pub fn new(harness: Arc<dyn EvaluationHarness>, config: ProtocolConfig) -> Self {
        Self { harness, config }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn protocol(&self) -> &'static dyn RoundProtocol {
        match self.config.protocol {
            ProtocolKind::Ond => &Ond,
            ProtocolKind::Condda => &Condda,
        }
    }

    /// Open a session for the algorithm, or resume the configured one
    fn open_session(&self, attributes: &mut AlgorithmAttributes, test_ids: &[String]) -> HarnessResult<()> {
        attributes.test_ids = test_ids.to_vec();
        let resume = self
            .config
            .resume_session
            .then(|| self.config.resume_session_ids.get(&attributes.name))
            .flatten();

        if let Some(session_id) = resume {
            let finished = self.harness.resume_session(session_id)?;
            attributes.remove_completed_tests(&finished);
            info!(
                algorithm = %attributes.name,
                session_id = %session_id,
                finished = finished.len(),
                remaining = attributes.test_ids.len(),
                "Resumed session"
            );
            attributes.session_id = Some(session_id.clone());
            return Ok(());
        }

        let request = SessionRequest {
            protocol: self.config.protocol.as_str().to_string(),
            domain: self.config.domain.clone(),
            detector: attributes.named_version(),
            hints: self.config.hints.clone(),
            detection_threshold: attributes.detection_threshold,
        };
        let session_id = self.harness.session_request(&attributes.test_ids, &request)?;
        info!(algorithm = %attributes.name, session_id = %session_id, "Created session");
        attributes.session_id = Some(session_id);
        Ok(())
    }

    /// Run every algorithm over every test, then terminate the sessions.
    ///
    /// A fatal error stops the run immediately and leaves the sessions open,
    /// so they can be resumed.
    pub fn run(&self, algorithms: &mut [RegisteredAlgorithm]) -> HarnessResult<Vec<AlgorithmReport>> {
        self.config.validate()?;
        let test_ids = self.config.resolve_test_ids(self.harness.as_ref())?;
        info!(
            protocol = %self.config.protocol,
            domain = %self.config.domain,
            tests = test_ids.len(),
            algorithms = algorithms.len(),
            "Starting run"
        );

        for entry in algorithms.iter_mut() {
            self.open_session(&mut entry.attributes, &test_ids)?;
        }

        let skip = self.config.effective_skip_stages();
        let protocol = self.protocol();
        let mut reports = Vec::with_capacity(algorithms.len());

        for entry in algorithms.iter_mut() {
            let attributes = &entry.attributes;
            let session_id = attributes
                .session_id
                .as_deref()
                .ok_or_else(|| HarnessError::config(format!("No session for {}", attributes.name)))?;
            let mut checkpoint = CheckpointStore::new(self.config.checkpoint.clone());
            let mut driver = TestDriver {
                harness: self.harness.clone(),
                session_id,
                algorithm_name: &attributes.name,
                parameters: &attributes.parameters,
                skip: &skip,
                features: &self.config.features,
                feedback_type: self.config.feedback_type,
                checkpoint: &mut checkpoint,
            };

            let mut tests = Vec::with_capacity(attributes.test_ids.len());
            for test_id in &attributes.test_ids {
                info!(algorithm = %attributes.name, test_id = %test_id, "Start test");
                tests.push(driver.run_test(protocol, test_id, entry.algorithm.as_mut())?);
            }
            reports.push(AlgorithmReport {
                name: attributes.name.clone(),
                session_id: session_id.to_string(),
                tests,
            });
        }

        for report in &reports {
            self.harness.terminate_session(&report.session_id)?;
            info!(algorithm = %report.name, session_id = %report.session_id, "Terminated session");
        }
        Ok(reports)
    }
}
