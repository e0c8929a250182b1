//! Run summary written next to the results of a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use round_harness::protocol::{AlgorithmReport, ProtocolConfig, TestState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUMMARY_FILE: &str = "run-summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSummary {
    pub name: String,
    pub session_id: String,
    pub tests_completed: Vec<String>,
    pub rounds: u32,
}

impl From<&AlgorithmReport> for AlgorithmSummary {
    fn from(report: &AlgorithmReport) -> Self {
        Self {
            name: report.name.clone(),
            session_id: report.session_id.clone(),
            tests_completed: report
                .tests
                .iter()
                .filter(|t| t.state == TestState::Completed)
                .map(|t| t.test_id.clone())
                .collect(),
            rounds: report.rounds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub protocol: String,
    pub domain: String,
    pub harness: String,
    pub finished_at: DateTime<Utc>,
    pub algorithms: Vec<AlgorithmSummary>,
}

impl RunSummary {
    pub fn new(protocol: &ProtocolConfig, harness: &str, reports: &[AlgorithmReport]) -> Self {
        Self {
            protocol: protocol.protocol.to_string(),
            domain: protocol.domain.clone(),
            harness: harness.to_string(),
            finished_at: Utc::now(),
            algorithms: reports.iter().map(AlgorithmSummary::from).collect(),
        }
    }

    /// Write `run-summary.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).context(format!("Failed to create {}", dir.display()))?;
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).context(format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use round_harness::protocol::TestOutcome;
    use round_harness::ProtocolKind;
    use tempfile::tempdir;

    fn outcome(test_id: &str, rounds: u32, state: TestState) -> TestOutcome {
        TestOutcome {
            test_id: test_id.into(),
            rounds,
            state,
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_summary_counts_completed_tests() {
        let report = AlgorithmReport {
            name: "mock".into(),
            session_id: "s-1".into(),
            tests: vec![
                outcome("t1", 3, TestState::Completed),
                outcome("t2", 2, TestState::Failed),
            ],
        };
        let config = ProtocolConfig::new(ProtocolKind::Condda, "transcripts");
        let summary = RunSummary::new(&config, "local", &[report]);

        assert_eq!(summary.protocol, "CONDDA");
        assert_eq!(summary.algorithms[0].tests_completed, vec!["t1"]);
        assert_eq!(summary.algorithms[0].rounds, 5);

        let dir = tempdir().unwrap();
        let path = summary.write(&dir.path().join("out")).unwrap();
        assert!(path.ends_with(SUMMARY_FILE));
        let restored: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(restored, summary);
    }
}
