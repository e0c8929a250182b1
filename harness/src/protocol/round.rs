//! Shared round/test skeleton
//!
//! Both protocol variants run the same test loop: initialize, then request
//! rounds until the harness signals end of data, extracting features and
//! detecting world change in every round. What else happens per round and
//! after the last one is the variant's [`RoundProtocol`] implementation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::algorithm::{
    FeatureExtractionParams, InitializeParams, NoveltyAlgorithm, RoundFeatures,
    WorldDetectionParams,
};
use super::features::{restore_features, save_features, FeatureSettings};
use super::state_machine::{TestState, TestStateMachine, TransitionRecord};
use crate::checkpoint::CheckpointStore;
use crate::error::{HarnessError, HarnessResult};
use crate::feedback::FeedbackClient;
use crate::harness::{EvaluationHarness, RoundData};
use crate::metadata::TestMetadata;
use crate::types::{FeedbackType, ProtocolKind, ResultType, Stage};

/// What a finished (or failed) test looked like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub rounds: u32,
    pub state: TestState,
    pub transitions: Vec<TransitionRecord>,
}

/// The part of a protocol that differs between variants
pub trait RoundProtocol {
    fn kind(&self) -> ProtocolKind;

    /// Feedback access handed to the algorithm at initialization
    fn feedback_client(
        &self,
        _driver: &TestDriver<'_>,
        _test_id: &str,
        _metadata: &TestMetadata,
    ) -> Option<FeedbackClient> {
        None
    }

    /// Stages after world detection within a round
    fn process_round(
        &self,
        driver: &mut TestDriver<'_>,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        round: &RoundData,
        features: &RoundFeatures,
    ) -> HarnessResult<()>;

    /// Stages after the last round
    fn finish_test(
        &self,
        _driver: &mut TestDriver<'_>,
        _test_id: &str,
        _algorithm: &mut dyn NoveltyAlgorithm,
        _ids: &[String],
        _features: &RoundFeatures,
    ) -> HarnessResult<()> {
        Ok(())
    }
}

/// Runs tests of one algorithm within one session
pub struct TestDriver<'a> {
    pub harness: Arc<dyn EvaluationHarness>,
    pub session_id: &'a str,
    pub algorithm_name: &'a str,
    pub parameters: &'a Map<String, Value>,
    pub skip: &'a BTreeSet<Stage>,
    pub features: &'a FeatureSettings,
    pub feedback_type: FeedbackType,
    pub checkpoint: &'a mut CheckpointStore,
}

impl TestDriver<'_> {
    pub fn is_skipped(&self, stage: Stage) -> bool {
        self.skip.contains(&stage)
    }

    /// Run one stage unless it is skipped, in which case `default` stands in.
    ///
    /// Saved attributes are restored before a round stage and accumulated
    /// after every stage.
    pub fn run_stage<T>(
        &mut self,
        test_id: &str,
        stage: Stage,
        round: Option<&RoundData>,
        algorithm: &mut dyn NoveltyAlgorithm,
        default: impl FnOnce() -> T,
        call: impl FnOnce(&mut dyn NoveltyAlgorithm) -> HarnessResult<T>,
    ) -> HarnessResult<T> {
        if self.is_skipped(stage) {
            debug!(test_id, %stage, "Skipping stage");
            return Ok(default());
        }

        if let Some(round) = round {
            self.checkpoint
                .restore_attributes(test_id, stage, round.round_id, &round.ids, &mut *algorithm)?;
        }
        let output = call(&mut *algorithm).map_err(|e| match e {
            HarnessError::Protocol { .. } | HarnessError::Server { .. } | HarnessError::Round { .. } => e,
            other => HarnessError::algorithm(stage, other.to_string()),
        })?;
        self.checkpoint.save_attributes(test_id, stage, &*algorithm)?;
        Ok(output)
    }

    /// Post results, warning instead when there is nothing to post
    pub fn post(
        &self,
        test_id: &str,
        round_id: u32,
        stage: Stage,
        results: BTreeMap<ResultType, String>,
    ) -> HarnessResult<()> {
        if results.is_empty() {
            warn!(test_id, round_id, %stage, "No result provided by the algorithm");
            return Ok(());
        }
        self.harness
            .post_results(self.session_id, test_id, round_id, &results)
    }

    /// Drive one test to completion
    pub fn run_test(
        &mut self,
        protocol: &dyn RoundProtocol,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
    ) -> HarnessResult<TestOutcome> {
        let mut sm = TestStateMachine::new();
        match self.drive(protocol, test_id, algorithm, &mut sm) {
            Ok(rounds) => Ok(TestOutcome {
                test_id: test_id.to_string(),
                rounds,
                state: sm.current(),
                transitions: sm.into_transitions(),
            }),
            Err(e) => {
                let _ = sm.fail(&e.to_string());
                error!(
                    test_id,
                    protocol = %protocol.kind(),
                    summary = %sm.summary(),
                    error = %e,
                    "Test failed"
                );
                Err(e)
            }
        }
    }

    fn drive(
        &mut self,
        protocol: &dyn RoundProtocol,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        sm: &mut TestStateMachine,
    ) -> HarnessResult<u32> {
        let metadata = self.harness.get_test_metadata(self.session_id, test_id)?;
        let red_light = metadata.red_light().map(str::to_string);

        let feedback = protocol.feedback_client(self, test_id, &metadata);
        let session_id = self.session_id;
        let parameters = self.parameters;
        self.run_stage(test_id, Stage::Initialize, None, algorithm, || (), |alg| {
            alg.initialize(InitializeParams {
                session_id,
                test_id,
                parameters,
                metadata: &metadata,
                feedback,
            })
        })?;
        sm.advance(TestState::Initialized, None)?;

        let saved = restore_features(self.features, test_id, self.algorithm_name)?;
        let mut aggregated = RoundFeatures::default();
        let mut test_ids = Vec::new();
        let mut rounds = 0;

        for round_id in 0u32.. {
            info!(test_id, round_id, "Start round");
            let round = match self.harness.dataset_request(self.session_id, test_id, round_id) {
                Ok(round) => round,
                Err(e) if e.is_round_end() => {
                    debug!(test_id, round_id, reason = ?e.reason(), "No more rounds");
                    break;
                }
                Err(e) => return Err(e),
            };
            sm.set_round(round_id);
            sm.advance(TestState::RoundLoop, None)?;

            let outcome = self.round_stages(protocol, test_id, algorithm, &saved, &round, red_light.as_deref());
            // The round file goes whether or not the stages succeeded
            let removed = round.remove();
            let features = outcome?;
            removed?;

            test_ids.extend(round.ids.iter().cloned());
            aggregated.extend(features);
            rounds += 1;
            info!(test_id, round_id, "Round complete");
        }

        sm.advance(TestState::Characterizing, Some("end of dataset"))?;
        protocol.finish_test(self, test_id, algorithm, &test_ids, &aggregated)?;

        self.harness.complete_test(self.session_id, test_id)?;
        if !self.is_skipped(Stage::SaveFeatures) {
            save_features(&self.features.feature_dir, test_id, self.algorithm_name, &aggregated)?;
        }
        self.checkpoint.persist(test_id)?;
        sm.advance(TestState::Completed, None)?;
        info!(test_id, rounds, summary = %sm.summary(), "Test complete");
        Ok(rounds)
    }

    /// Feature extraction, world detection and the protocol's own round stages
    fn round_stages(
        &mut self,
        protocol: &dyn RoundProtocol,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        saved: &RoundFeatures,
        round: &RoundData,
        red_light: Option<&str>,
    ) -> HarnessResult<RoundFeatures> {
        let round_id = round.round_id;
        let features = self.extract_features(test_id, algorithm, saved, round)?;

        let wd_params = WorldDetectionParams {
            features: &features,
            ids: &round.ids,
            round_id,
            red_light,
        };
        let detection = self.run_stage(
            test_id,
            Stage::WorldDetection,
            Some(round),
            algorithm,
            || None,
            |alg| alg.world_detection(&wd_params).map(Some),
        )?;
        if let Some(content) = detection {
            self.post(
                test_id,
                round_id,
                Stage::WorldDetection,
                BTreeMap::from([(ResultType::Detection, content)]),
            )?;
        }

        protocol.process_round(self, test_id, algorithm, round, &features)?;
        Ok(features)
    }

    /// Features for a round, reusing saved features when they cover every id
    fn extract_features(
        &mut self,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        saved: &RoundFeatures,
        round: &RoundData,
    ) -> HarnessResult<RoundFeatures> {
        if !self.is_skipped(Stage::FeatureExtraction) && !saved.is_empty() {
            if let Some(features) = saved.select(&round.ids) {
                debug!(test_id, round_id = round.round_id, "Reusing saved features");
                return Ok(features);
            }
        }

        let params = FeatureExtractionParams {
            dataset: &round.path,
            ids: &round.ids,
            round_id: round.round_id,
        };
        self.run_stage(
            test_id,
            Stage::FeatureExtraction,
            Some(round),
            algorithm,
            RoundFeatures::default,
            |alg| alg.feature_extraction(&params),
        )
    }
}
