//! Open-world novelty detection (OND)
//!
//! Per round: novelty classification is posted after world detection, then
//! the algorithm may adapt using budgeted feedback. After the last round the
//! whole test is characterized once.

use std::collections::BTreeMap;
use tracing::{info, warn};

use super::algorithm::{
    NoveltyAdaptationParams, NoveltyAlgorithm, NoveltyCharacterizationParams,
    NoveltyClassificationParams, RoundFeatures,
};
use super::round::{RoundProtocol, TestDriver};
use crate::error::HarnessResult;
use crate::feedback::{FeedbackBudget, FeedbackClient};
use crate::harness::RoundData;
use crate::metadata::TestMetadata;
use crate::types::{ProtocolKind, ResultType, Stage};

#[derive(Debug, Clone, Copy, Default)]
pub struct Ond;

impl RoundProtocol for Ond {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ond
    }

    fn feedback_client(
        &self,
        driver: &TestDriver<'_>,
        test_id: &str,
        metadata: &TestMetadata,
    ) -> Option<FeedbackClient> {
        if driver.is_skipped(Stage::CreateFeedbackInstance) {
            return None;
        }
        let budget = metadata.feedback_max_ids().unwrap_or_else(|| {
            warn!(test_id, "feedback_max_ids missing from metadata, feedback budget is 0");
            0
        });
        info!(test_id, budget, feedback_type = %driver.feedback_type, "Creating feedback client");
        Some(FeedbackClient::new(
            driver.harness.clone(),
            driver.session_id,
            test_id,
            driver.feedback_type,
            FeedbackBudget::uniform(budget),
        ))
    }

    fn process_round(
        &self,
        driver: &mut TestDriver<'_>,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        round: &RoundData,
        features: &RoundFeatures,
    ) -> HarnessResult<()> {
        let nc_params = NoveltyClassificationParams {
            features,
            ids: &round.ids,
            round_id: round.round_id,
        };
        let classification = driver.run_stage(
            test_id,
            Stage::NoveltyClassification,
            Some(round),
            algorithm,
            || None,
            |alg| alg.novelty_classification(&nc_params).map(Some),
        )?;
        if let Some(content) = classification {
            driver.post(
                test_id,
                round.round_id,
                Stage::NoveltyClassification,
                BTreeMap::from([(ResultType::Classification, content)]),
            )?;
        }

        let na_params = NoveltyAdaptationParams {
            round_id: round.round_id,
        };
        driver.run_stage(
            test_id,
            Stage::NoveltyAdaptation,
            Some(round),
            algorithm,
            || (),
            |alg| alg.novelty_adaptation(&na_params),
        )
    }

    fn finish_test(
        &self,
        driver: &mut TestDriver<'_>,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        ids: &[String],
        features: &RoundFeatures,
    ) -> HarnessResult<()> {
        let params = NoveltyCharacterizationParams {
            features,
            ids,
            round_id: None,
        };
        let results = driver.run_stage(
            test_id,
            Stage::NoveltyCharacterization,
            None,
            algorithm,
            BTreeMap::new,
            |alg| alg.novelty_characterization(&params),
        )?;
        if driver.is_skipped(Stage::NoveltyCharacterization) {
            return Ok(());
        }
        driver.post(test_id, 0, Stage::NoveltyCharacterization, results)
    }
}
