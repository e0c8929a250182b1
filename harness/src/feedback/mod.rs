//! Feedback broker
//!
//! Serves ground-truth derived feedback for posted results. What backs each
//! (domain, feedback type) pair, whether it draws from the test's budget and
//! how it is gated on a prior novelty declaration is a static table.

pub mod budget;
pub mod compute;

pub use budget::{FeedbackBudget, FeedbackClient};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, error, warn};

use crate::dataset::{ground_truth_path, read_ground_truth, read_rows};
use crate::error::{HarnessError, HarnessResult};
use crate::ledger::ResultsLedger;
use crate::lifecycle::{SessionRequest, SessionStore, TestActivityKind, TestRecord};
use crate::metadata::{load_metadata, TestMetadata};
use crate::types::{DetectionRequirement, Domain, FeedbackType, ResultType};

/// Metadata key holding the detection feedback budget
pub const DETECTION_BUDGET_KEY: &str = "max_detection_feedback_ids";

// ============================================================================
// Transport
// ============================================================================

/// One `id,value[,value...]` feedback row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub id: String,
    pub values: Vec<String>,
}

impl FeedbackRow {
    pub fn new(id: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }
}

/// Render rows as the newline-delimited feedback transport
pub fn render_rows(rows: &[FeedbackRow]) -> String {
    rows.iter()
        .map(|row| {
            let mut line = row.id.clone();
            for value in &row.values {
                line.push(',');
                line.push_str(value);
            }
            line.push('\n');
            line
        })
        .collect()
}

/// Parse the feedback transport
pub fn parse_rows(content: &str) -> Vec<FeedbackRow> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split(',').map(|f| f.trim().to_string());
            let id = fields.next().unwrap_or_default();
            FeedbackRow::new(id, fields.collect())
        })
        .collect()
}

// ============================================================================
// Definitions
// ============================================================================

/// How a feedback value is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Computation {
    Classification,
    ClassificationRange,
    Detection,
    Score,
    Transcription,
    PseudoLabels,
}

/// One row of the feedback table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackDefinition {
    /// Posted result type the computation reads
    pub source: ResultType,
    pub columns: &'static [usize],
    pub computation: Computation,
    pub detection_requirement: DetectionRequirement,
    pub budgeted: bool,
    /// Metadata key that replaces `feedback_max_ids` as the budget
    pub alternate_budget: Option<&'static str>,
}

impl FeedbackDefinition {
    const fn new(
        source: ResultType,
        columns: &'static [usize],
        computation: Computation,
        detection_requirement: DetectionRequirement,
        budgeted: bool,
    ) -> Self {
        Self {
            source,
            columns,
            computation,
            detection_requirement,
            budgeted,
            alternate_budget: None,
        }
    }

    const fn with_alternate_budget(mut self, key: &'static str) -> Self {
        self.alternate_budget = Some(key);
        self
    }

    /// Budget for a test: the alternate key when present, else `feedback_max_ids`
    pub fn budget(&self, metadata: &TestMetadata) -> usize {
        self.alternate_budget
            .and_then(|key| metadata.get_usize(key))
            .or_else(|| metadata.feedback_max_ids())
            .unwrap_or(0)
    }
}

/// Feedback table lookup. `None` means the type is not offered for the domain.
pub fn definition(domain: Domain, feedback_type: FeedbackType) -> Option<FeedbackDefinition> {
    use Computation as C;
    use DetectionRequirement as D;
    use FeedbackType as F;
    use ResultType as R;

    let detection = FeedbackDefinition::new(R::Detection, &[0], C::Detection, D::Skip, true)
        .with_alternate_budget(DETECTION_BUDGET_KEY);

    match (domain, feedback_type) {
        (Domain::ImageClassification, F::Classification) => Some(FeedbackDefinition::new(
            R::Classification,
            &[1],
            C::Classification,
            D::NotifyAndContinue,
            true,
        )),
        (Domain::ImageClassification, F::Score) => Some(FeedbackDefinition::new(
            R::Classification,
            &[1],
            C::Score,
            D::Skip,
            false,
        )),
        (Domain::ImageClassification, F::PseudoClassification) => Some(FeedbackDefinition::new(
            R::Classification,
            &[1],
            C::PseudoLabels,
            D::Skip,
            true,
        )),
        (Domain::ImageClassification | Domain::ActivityRecognition, F::Detection) => Some(detection),
        (Domain::Transcripts, F::Classification) => Some(FeedbackDefinition::new(
            R::Classification,
            &[4],
            C::Classification,
            D::Skip,
            true,
        )),
        (Domain::Transcripts, F::Transcription) => Some(FeedbackDefinition::new(
            R::Transcription,
            &[0],
            C::Transcription,
            D::Skip,
            true,
        )),
        (Domain::Transcripts, F::Score) => Some(FeedbackDefinition::new(
            R::Classification,
            &[4],
            C::Score,
            D::Skip,
            false,
        )),
        (Domain::ActivityRecognition, F::Classification) => Some(FeedbackDefinition::new(
            R::Classification,
            &[5, 10],
            C::ClassificationRange,
            D::Skip,
            true,
        )),
        (Domain::ActivityRecognition, F::Score) => Some(FeedbackDefinition::new(
            R::Classification,
            &[2],
            C::Score,
            D::Skip,
            false,
        )),
        _ => None,
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeedbackBroker {
    data_dir: PathBuf,
    store: SessionStore,
    ledger: ResultsLedger,
}

impl FeedbackBroker {
    pub fn new(data_dir: impl Into<PathBuf>, store: SessionStore, ledger: ResultsLedger) -> Self {
        Self {
            data_dir: data_dir.into(),
            store,
            ledger,
        }
    }

    /// Serve feedback for a test.
    ///
    /// Usage is counted against the latest round with posted results. For
    /// budgeted types at most `budget - used` rows are returned. An empty
    /// result means the request was gated.
    pub fn get_feedback(
        &self,
        session_id: &str,
        test_id: &str,
        feedback_type: FeedbackType,
        ids: &[String],
    ) -> HarnessResult<Vec<FeedbackRow>> {
        let session = self.store.active_session(session_id)?;
        let request = session.request(session_id)?;
        let metadata = load_metadata(&self.data_dir, request, test_id, false)?;
        let record = self.store.test(session_id, test_id)?;

        let domain: Domain = request.domain.parse().map_err(|_| {
            HarnessError::protocol(
                "BadDomain",
                format!(
                    "The set domain does not match a domain type. \
                     Please check the metadata file for {test_id}"
                ),
            )
        })?;
        let def = definition(domain, feedback_type).ok_or_else(|| {
            HarnessError::protocol(
                "InvalidFeedbackType",
                format!(
                    "Invalid feedback type {feedback_type} requested for the test id \
                     {test_id} with domain {domain}"
                ),
            )
        })?;

        let red_light_mode = request.is_red_light_mode();
        let budgeted = def.budgeted && !(feedback_type == FeedbackType::Detection && red_light_mode);
        let budget = def.budget(&metadata);

        let round_id = record.last_posted_round().unwrap_or(0);
        let used = record.feedback_served(round_id, feedback_type).unwrap_or(0);
        if budgeted && used >= budget {
            return Err(HarnessError::protocol(
                "FeedbackBudgetExceeded",
                format!(
                    "Feedback of type {feedback_type} has already been requested on the \
                     maximum number of ids"
                ),
            ));
        }

        let gt_path = ground_truth_path(&self.data_dir, &request.protocol, &request.domain, test_id);
        if !gt_path.exists() {
            return Err(HarnessError::server(
                "test_id_invalid",
                format!("Could not find ground truth file for test Id {test_id}"),
            ));
        }
        let result_file = self.ledger.artifact_path(request, session_id, test_id, def.source);

        if !self.detection_gate_open(&def, request, &metadata, &record, session_id, test_id)? {
            return Ok(Vec::new());
        }

        let ground_truth = read_ground_truth(&gt_path)?;
        let input = compute::FeedbackInput {
            ground_truth: &ground_truth,
            result_file: &result_file,
            metadata: &metadata,
            columns: def.columns,
            ids,
        };
        let rows = match def.computation {
            Computation::Classification => compute::classification(&input)?,
            Computation::ClassificationRange => compute::classification_range(&input)?,
            Computation::Detection => compute::detection(&input)?,
            Computation::Score => compute::score(&input)?,
            Computation::Transcription => compute::transcription(&input)?,
            Computation::PseudoLabels => {
                let key = def.source.as_str();
                let mut labels = session.pseudo_labels.get(key).cloned().unwrap_or_default();
                let rows = compute::pseudo_labels(&input, &mut labels)?;
                self.store.store_pseudo_labels(session_id, key, labels)?;
                rows
            }
        };

        let mut served = rows.len();
        if budgeted {
            served = served.min(budget - used);
        }
        let total = used + served;

        self.store.record_test_activity(
            session_id,
            test_id,
            TestActivityKind::GetFeedback,
            Some(round_id),
            |activity| {
                let entry = activity.round_mut(round_id);
                entry.feedback.insert(feedback_type, total);
                entry.feedback_budget = Some(budget);
            },
        )?;
        debug!(session_id, test_id, round_id, %feedback_type, served, total, budget, "Served feedback");

        Ok(rows.into_iter().take(served).collect())
    }

    /// Whether novelty was declared strongly enough for this feedback.
    ///
    /// Returns `false` when the request should be answered with nothing.
    fn detection_gate_open(
        &self,
        def: &FeedbackDefinition,
        request: &SessionRequest,
        metadata: &TestMetadata,
        record: &TestRecord,
        session_id: &str,
        test_id: &str,
    ) -> HarnessResult<bool> {
        if def.detection_requirement == DetectionRequirement::Ignore {
            return Ok(true);
        }

        let Some(detection_file) = record.result_file(ResultType::Detection) else {
            return Err(HarnessError::protocol(
                "DetectionPostRequired",
                "A detection file is required to be posted before feedback can be requested \
                 on a round. Please submit Detection results before requesting feedback",
            ));
        };

        let cant_read = |detail: String| {
            HarnessError::server(
                "CantReadFile",
                format!(
                    "Couldn't open the logged detection file at {} for test id {test_id}: {detail}",
                    detection_file.display()
                ),
            )
        };
        let rows = read_rows(detection_file, None, false).map_err(|e| cant_read(e.to_string()))?;
        let mut max_score = f64::NEG_INFINITY;
        for row in &rows {
            let raw = row.get(1).map(|v| v.trim()).unwrap_or("");
            let score: f64 = raw
                .parse()
                .map_err(|_| cant_read(format!("bad detection score {raw:?}")))?;
            max_score = max_score.max(score);
        }

        let given = request.is_red_light_mode()
            && metadata
                .red_light()
                .is_some_and(|red| rows.iter().any(|row| row.first().is_some_and(|id| id == red)));

        if max_score > request.detection_threshold || given {
            return Ok(true);
        }

        match def.detection_requirement {
            DetectionRequirement::Ignore => Ok(true),
            DetectionRequirement::NotifyAndContinue => {
                error!(
                    session_id,
                    test_id,
                    "Feedback requested prior to the threshold indication"
                );
                Ok(true)
            }
            DetectionRequirement::Skip => {
                warn!(
                    session_id,
                    test_id,
                    "Feedback requested prior to the threshold indication, serving nothing"
                );
                Ok(false)
            }
            DetectionRequirement::Required => Err(HarnessError::protocol(
                "NoveltyDetectionRequired",
                "In order to request feedback, novelty must be declared for the test",
            )),
        }
    }
}
