//! Local file provider
//!
//! The evaluation service as plain function calls over a ground-truth
//! directory and a results directory. Every operation raises the same typed
//! failures the network service maps to status codes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::dataset::{ground_truth_path, RoundDataSource};
use crate::error::{HarnessError, HarnessResult};
use crate::feedback::{FeedbackBroker, FeedbackRow};
use crate::ledger::ResultsLedger;
use crate::lifecycle::{SessionRequest, SessionStore};
use crate::metadata::{load_metadata, TestMetadata};
use crate::types::{FeedbackType, ResultType};

/// Name of the generated test id list inside `<data>/<protocol>/<domain>/`
pub const TEST_IDS_FILE: &str = "test_ids.csv";

const GROUND_TRUTH_SUFFIX: &str = "_single_df.csv";

#[derive(Debug, Clone)]
pub struct FileProvider {
    data_dir: PathBuf,
    store: SessionStore,
    ledger: ResultsLedger,
    source: RoundDataSource,
    broker: FeedbackBroker,
}

impl FileProvider {
    /// Provider over `data_dir`, keeping logs and results under `results_dir`
    pub fn new(data_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> HarnessResult<Self> {
        let data_dir = data_dir.into();
        let store = SessionStore::new(results_dir)?;
        let ledger = ResultsLedger::new(store.clone());
        Ok(Self {
            source: RoundDataSource::new(&data_dir, store.clone(), ledger.clone()),
            broker: FeedbackBroker::new(&data_dir, store.clone(), ledger.clone()),
            data_dir,
            store,
            ledger,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn ledger(&self) -> &ResultsLedger {
        &self.ledger
    }

    /// Location of the test id list for a protocol and domain.
    ///
    /// The list is generated from the ground-truth files when it does not
    /// exist yet. The detector seed and assumptions do not influence local
    /// test selection.
    pub fn test_ids_request(
        &self,
        protocol: &str,
        domain: &str,
        detector_seed: &str,
    ) -> HarnessResult<PathBuf> {
        let domain_dir = self.data_dir.join(protocol).join(domain);
        let location = domain_dir.join(TEST_IDS_FILE);
        if location.exists() {
            return Ok(location);
        }

        if !self.data_dir.join(protocol).is_dir() {
            return Err(HarnessError::protocol(
                "BadDomain",
                format!("{protocol} not configured"),
            ));
        }
        if !domain_dir.is_dir() {
            return Err(HarnessError::protocol(
                "BadDomain",
                format!("domain {domain} for {protocol} not configured"),
            ));
        }

        let mut test_ids = Vec::new();
        for entry in std::fs::read_dir(&domain_dir)? {
            let name = entry?.file_name();
            if let Some(test_id) = name.to_str().and_then(|n| n.strip_suffix(GROUND_TRUTH_SUFFIX)) {
                test_ids.push(test_id.to_string());
            }
        }
        test_ids.sort();
        std::fs::write(&location, crate::dataset::render_round(&test_ids))?;
        info!(
            protocol,
            domain,
            detector_seed,
            tests = test_ids.len(),
            path = %location.display(),
            "Generated test id list"
        );
        Ok(location)
    }

    /// Create a session over `test_ids`. Every test needs a ground-truth file.
    pub fn new_session(&self, test_ids: &[String], request: SessionRequest) -> HarnessResult<String> {
        for test_id in test_ids {
            let gt = ground_truth_path(&self.data_dir, &request.protocol, &request.domain, test_id);
            if !gt.exists() {
                return Err(HarnessError::protocol(
                    "test_id_invalid",
                    format!("Test Id {test_id} could not be matched to a specific file"),
                ));
            }
        }
        self.store.create_session(request)
    }

    /// Tests already completed in a session
    pub fn latest_session_info(&self, session_id: &str) -> HarnessResult<Vec<String>> {
        self.store.finished_tests(session_id)
    }

    /// Metadata of a test in a session.
    ///
    /// With `api_call` the allow-list applies. With `in_process_only` a
    /// terminated session is rejected.
    pub fn get_test_metadata(
        &self,
        session_id: &str,
        test_id: &str,
        api_call: bool,
        in_process_only: bool,
    ) -> HarnessResult<TestMetadata> {
        let session = self.store.session(session_id, in_process_only)?;
        let request = session.request(session_id)?;
        load_metadata(&self.data_dir, request, test_id, api_call)
    }

    pub fn dataset_request(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
    ) -> HarnessResult<Option<Vec<String>>> {
        self.source.request_round(session_id, test_id, round_id)
    }

    pub fn get_feedback(
        &self,
        session_id: &str,
        test_id: &str,
        feedback_type: FeedbackType,
        ids: &[String],
    ) -> HarnessResult<Vec<FeedbackRow>> {
        self.broker.get_feedback(session_id, test_id, feedback_type, ids)
    }

    pub fn post_results(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        results: &BTreeMap<ResultType, String>,
    ) -> HarnessResult<()> {
        self.ledger.post_results(session_id, test_id, round_id, results)
    }

    pub fn complete_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()> {
        self.store.complete_test(session_id, test_id)
    }

    pub fn terminate_session(&self, session_id: &str) -> HarnessResult<()> {
        self.store.terminate_session(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(data: &Path) {
        let base = data.join("OND").join("image_classification");
        std::fs::create_dir_all(&base).unwrap();
        for test in ["OND.1.1.1234", "OND.1.2.1234"] {
            std::fs::write(
                base.join(format!("{test}_single_df.csv")),
                "image_path,class\na.png,1\nb.png,2\nc.png,3\n",
            )
            .unwrap();
            std::fs::write(
                base.join(format!("{test}_metadata.json")),
                r#"{"round_size": 2, "feedback_max_ids": 1, "protocol": "OND"}"#,
            )
            .unwrap();
        }
    }

    fn request() -> SessionRequest {
        SessionRequest {
            protocol: "OND".into(),
            domain: "image_classification".into(),
            detector: "mock-0.1.0".into(),
            hints: vec![],
            detection_threshold: 0.5,
        }
    }

    #[test]
    fn test_generates_test_ids() {
        let data = tempdir().unwrap();
        let results = tempdir().unwrap();
        seed(data.path());
        let provider = FileProvider::new(data.path(), results.path()).unwrap();

        let path = provider
            .test_ids_request("OND", "image_classification", "5678")
            .unwrap();
        let ids = crate::dataset::parse_round(&std::fs::read_to_string(path).unwrap());
        assert_eq!(ids, vec!["OND.1.1.1234", "OND.1.2.1234"]);

        let err = provider.test_ids_request("CONDDA", "image_classification", "5678").unwrap_err();
        assert_eq!(err.reason(), Some("BadDomain"));
        let err = provider.test_ids_request("OND", "transcripts", "5678").unwrap_err();
        assert_eq!(err.reason(), Some("BadDomain"));
    }

    #[test]
    fn test_session_requires_datasets() {
        let data = tempdir().unwrap();
        let results = tempdir().unwrap();
        seed(data.path());
        let provider = FileProvider::new(data.path(), results.path()).unwrap();

        let err = provider
            .new_session(&["OND.9.9.1234".to_string()], request())
            .unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(err.reason(), Some("test_id_invalid"));

        let sid = provider
            .new_session(&["OND.1.1.1234".to_string()], request())
            .unwrap();
        let md = provider.get_test_metadata(&sid, "OND.1.1.1234", true, true).unwrap();
        assert_eq!(md.round_size(), Some(2));
    }

    #[test]
    fn test_terminated_session_rejects_everything() {
        let data = tempdir().unwrap();
        let results = tempdir().unwrap();
        seed(data.path());
        let provider = FileProvider::new(data.path(), results.path()).unwrap();
        let test = "OND.1.1.1234".to_string();
        let sid = provider.new_session(std::slice::from_ref(&test), request()).unwrap();

        provider.dataset_request(&sid, &test, 0).unwrap();
        provider.complete_test(&sid, &test).unwrap();
        assert_eq!(provider.latest_session_info(&sid).unwrap(), vec![test.clone()]);
        provider.terminate_session(&sid).unwrap();

        let ended = |err: HarnessError| err.is_protocol() && err.reason() == Some("SessionEnded");
        assert!(ended(provider.dataset_request(&sid, "OND.1.2.1234", 0).unwrap_err()));
        assert!(ended(provider.get_test_metadata(&sid, &test, true, true).unwrap_err()));
        assert!(ended(provider.latest_session_info(&sid).unwrap_err()));
        assert!(ended(
            provider
                .post_results(
                    &sid,
                    "OND.1.2.1234",
                    0,
                    &BTreeMap::from([(ResultType::Detection, "a.png,0.1\n".to_string())]),
                )
                .unwrap_err()
        ));
        assert!(ended(
            provider
                .get_feedback(&sid, "OND.1.2.1234", FeedbackType::Classification, &[])
                .unwrap_err()
        ));
        assert!(ended(provider.complete_test(&sid, "OND.1.2.1234").unwrap_err()));

        // Metadata stays readable outside in-process mode
        assert!(provider.get_test_metadata(&sid, &test, true, false).is_ok());
        // Terminating again is a no-op
        provider.terminate_session(&sid).unwrap();
    }
}
