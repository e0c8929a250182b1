//! In-process harness over the file provider

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{end_of_dataset, EvaluationHarness, RoundData};
use crate::dataset::render_round;
use crate::error::HarnessResult;
use crate::feedback::{render_rows, FeedbackRow};
use crate::lifecycle::SessionRequest;
use crate::metadata::TestMetadata;
use crate::provider::FileProvider;
use crate::types::{FeedbackType, ResultType};

/// Harness backed by local ground truth.
///
/// Round and feedback files are written to `work_dir`, the same way the
/// network harness saves service responses.
#[derive(Debug, Clone)]
pub struct LocalHarness {
    provider: FileProvider,
    work_dir: PathBuf,
}

impl LocalHarness {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        result_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> HarnessResult<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            provider: FileProvider::new(data_dir, result_dir)?,
            work_dir,
        })
    }

    pub fn provider(&self) -> &FileProvider {
        &self.provider
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

impl EvaluationHarness for LocalHarness {
    fn name(&self) -> &'static str {
        "local"
    }

    fn test_ids_request(
        &self,
        protocol: &str,
        domain: &str,
        detector_seed: &str,
        _test_assumptions: Option<&Path>,
    ) -> HarnessResult<PathBuf> {
        self.provider.test_ids_request(protocol, domain, detector_seed)
    }

    fn session_request(&self, test_ids: &[String], request: &SessionRequest) -> HarnessResult<String> {
        self.provider.new_session(test_ids, request.clone())
    }

    fn resume_session(&self, session_id: &str) -> HarnessResult<Vec<String>> {
        self.provider.latest_session_info(session_id)
    }

    fn dataset_request(&self, session_id: &str, test_id: &str, round_id: u32) -> HarnessResult<RoundData> {
        let Some(ids) = self.provider.dataset_request(session_id, test_id, round_id)? else {
            return Err(end_of_dataset(test_id, round_id));
        };
        let path = self
            .work_dir
            .join(format!("{session_id}.{test_id}.{round_id}.csv"));
        std::fs::write(&path, render_round(&ids))?;
        Ok(RoundData { round_id, path, ids })
    }

    fn get_feedback_request(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        feedback_type: FeedbackType,
        ids: &[String],
    ) -> HarnessResult<Vec<FeedbackRow>> {
        let rows = self.provider.get_feedback(session_id, test_id, feedback_type, ids)?;
        let path = self
            .work_dir
            .join(format!("{session_id}.{test_id}.{round_id}_{feedback_type}.csv"));
        std::fs::write(&path, render_rows(&rows))?;
        debug!(path = %path.display(), rows = rows.len(), "Wrote feedback file");
        Ok(rows)
    }

    fn post_results(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        results: &BTreeMap<ResultType, String>,
    ) -> HarnessResult<()> {
        self.provider.post_results(session_id, test_id, round_id, results)
    }

    fn get_test_metadata(&self, session_id: &str, test_id: &str) -> HarnessResult<TestMetadata> {
        self.provider.get_test_metadata(session_id, test_id, true, true)
    }

    fn complete_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()> {
        self.provider.complete_test(session_id, test_id)
    }

    fn terminate_session(&self, session_id: &str) -> HarnessResult<()> {
        self.provider.terminate_session(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rounds_until_end_of_data() {
        let data = tempdir().unwrap();
        let results = tempdir().unwrap();
        let work = tempdir().unwrap();
        let base = data.path().join("OND").join("image_classification");
        std::fs::create_dir_all(&base).unwrap();
        let mut gt = String::from("image_path,class\n");
        for i in 0..120 {
            gt.push_str(&format!("img_{i}.png,{}\n", i % 3));
        }
        std::fs::write(base.join("t1_single_df.csv"), gt).unwrap();
        std::fs::write(base.join("t1_metadata.json"), r#"{"round_size": 50}"#).unwrap();

        let harness = LocalHarness::new(data.path(), results.path(), work.path()).unwrap();
        let sid = harness
            .session_request(
                &["t1".to_string()],
                &SessionRequest {
                    protocol: "OND".into(),
                    domain: "image_classification".into(),
                    detector: "mock-0.1.0".into(),
                    hints: vec![],
                    detection_threshold: 0.5,
                },
            )
            .unwrap();

        let sizes: Vec<usize> = (0..3)
            .map(|r| harness.dataset_request(&sid, "t1", r).unwrap().ids.len())
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);

        let round = harness.dataset_request(&sid, "t1", 2).unwrap();
        assert_eq!(round.ids[0], "img_100.png");
        assert!(round.path.exists());
        assert_eq!(
            crate::dataset::parse_round(&std::fs::read_to_string(&round.path).unwrap()),
            round.ids
        );

        let err = harness.dataset_request(&sid, "t1", 3).unwrap_err();
        assert!(err.is_round_end());
    }
}
