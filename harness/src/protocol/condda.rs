//! Continual novelty detection and discovery (CONDDA)
//!
//! No classification and no feedback: every round is characterized
//! incrementally right after world detection.

use super::algorithm::{NoveltyAlgorithm, NoveltyCharacterizationParams, RoundFeatures};
use super::round::{RoundProtocol, TestDriver};
use crate::error::HarnessResult;
use crate::harness::RoundData;
use crate::types::{ProtocolKind, Stage};

#[derive(Debug, Clone, Copy, Default)]
pub struct Condda;

impl RoundProtocol for Condda {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Condda
    }

    fn process_round(
        &self,
        driver: &mut TestDriver<'_>,
        test_id: &str,
        algorithm: &mut dyn NoveltyAlgorithm,
        round: &RoundData,
        features: &RoundFeatures,
    ) -> HarnessResult<()> {
        let params = NoveltyCharacterizationParams {
            features,
            ids: &round.ids,
            round_id: Some(round.round_id),
        };
        let results = driver.run_stage(
            test_id,
            Stage::NoveltyCharacterization,
            Some(round),
            algorithm,
            Default::default,
            |alg| alg.novelty_characterization(&params),
        )?;
        if driver.is_skipped(Stage::NoveltyCharacterization) {
            return Ok(());
        }
        driver.post(test_id, round.round_id, Stage::NoveltyCharacterization, results)
    }
}
