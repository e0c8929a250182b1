//! Evaluation harness
//!
//! The surface the protocol drivers talk to. Two implementations:
//! - [`LocalHarness`] runs the file provider in-process
//! - [`ParHarness`] talks to the evaluation service over HTTP
//!
//! Both raise the same typed failures; end of data is always a `Round` error.

pub mod local;
pub mod par;

pub use local::LocalHarness;
pub use par::ParHarness;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, HarnessResult};
use crate::feedback::FeedbackRow;
use crate::lifecycle::SessionRequest;
use crate::metadata::TestMetadata;
use crate::types::{FeedbackType, ResultType};

/// One round of data, materialized as a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundData {
    pub round_id: u32,
    /// Newline-delimited instance ids
    pub path: PathBuf,
    pub ids: Vec<String>,
}

impl RoundData {
    /// Delete the round file
    pub fn remove(&self) -> HarnessResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Operations of the evaluation service
pub trait EvaluationHarness: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// File listing the test ids for a protocol and domain
    fn test_ids_request(
        &self,
        protocol: &str,
        domain: &str,
        detector_seed: &str,
        test_assumptions: Option<&Path>,
    ) -> HarnessResult<PathBuf>;

    /// Create a session over `test_ids` and return its id
    fn session_request(&self, test_ids: &[String], request: &SessionRequest) -> HarnessResult<String>;

    /// Tests already finished in a session
    fn resume_session(&self, session_id: &str) -> HarnessResult<Vec<String>>;

    /// Data for a round. Fails with a `Round` error once the test is exhausted.
    fn dataset_request(&self, session_id: &str, test_id: &str, round_id: u32) -> HarnessResult<RoundData>;

    fn get_feedback_request(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        feedback_type: FeedbackType,
        ids: &[String],
    ) -> HarnessResult<Vec<FeedbackRow>>;

    /// Post result contents keyed by result type
    fn post_results(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        results: &BTreeMap<ResultType, String>,
    ) -> HarnessResult<()>;

    /// Client view of a test's metadata
    fn get_test_metadata(&self, session_id: &str, test_id: &str) -> HarnessResult<TestMetadata>;

    fn complete_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()>;

    fn terminate_session(&self, session_id: &str) -> HarnessResult<()>;
}

/// Read test ids from a newline-delimited file
pub fn read_test_ids(path: &Path) -> HarnessResult<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        HarnessError::config(format!("Cannot read test ids from {}: {e}", path.display()))
    })?;
    Ok(crate::dataset::parse_round(&raw))
}

/// End-of-data error for a test
pub(crate) fn end_of_dataset(test_id: &str, round_id: u32) -> HarnessError {
    HarnessError::round(
        "End of Dataset",
        format!("The entire dataset for test {test_id} has been requested (round {round_id})"),
    )
}
