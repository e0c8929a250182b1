//! Session/test lifecycle store
//!
//! Durable, single-writer record of everything that happens in a session.
//! One JSON file per session (`<results>/<session>.json`) and one per
//! (session, test) pair (`<results>/<session>.<test>.json`). Every mutation
//! re-reads the current record, merges the new activity and writes the whole
//! record back; concurrent writers to the same pair are last-write-wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::types::{FeedbackType, ResultType};

/// Hint that puts the session in given-detection (red light) mode
pub const RED_LIGHT_HINT: &str = "red_light";

// ============================================================================
// Session record
// ============================================================================

/// Parameters of a session request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub protocol: String,
    pub domain: String,
    /// Named algorithm version (`name-version`)
    pub detector: String,
    #[serde(default)]
    pub hints: Vec<String>,
    pub detection_threshold: f64,
}

impl SessionRequest {
    /// Whether the session runs with a given-detection hint
    pub fn is_red_light_mode(&self) -> bool {
        self.hints.iter().any(|h| h == RED_LIGHT_HINT)
    }

    /// `key=value` hints, parsed as integer overrides. Malformed values are ignored.
    pub fn hint_overrides(&self) -> BTreeMap<String, i64> {
        self.hints
            .iter()
            .filter_map(|hint| {
                let (key, value) = hint.split_once('=')?;
                let value = value.trim().parse::<i64>().ok()?;
                Some((key.trim().to_string(), value))
            })
            .collect()
    }
}

/// A timestamped activity with no extra content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStamp {
    pub time: Vec<DateTime<Utc>>,
}

impl ActivityStamp {
    fn now() -> Self {
        Self {
            time: vec![Utc::now()],
        }
    }
}

/// `created` activity: the session request plus when it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedActivity {
    pub time: Vec<DateTime<Utc>>,
    #[serde(flatten)]
    pub request: SessionRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedTests {
    pub completed_tests: Vec<String>,
}

/// Persisted session-level log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<CreatedActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<CompletedTests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<ActivityStamp>,
    /// Pseudo-label assignment per feedback type, in first-seen order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pseudo_labels: BTreeMap<String, Vec<i64>>,
}

impl SessionRecord {
    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    pub fn completed_tests(&self) -> &[String] {
        self.tests
            .as_ref()
            .map(|t| t.completed_tests.as_slice())
            .unwrap_or(&[])
    }

    /// Session request, or `session_id_invalid` when the session was never created
    pub fn request(&self, session_id: &str) -> HarnessResult<&SessionRequest> {
        self.created
            .as_ref()
            .map(|c| &c.request)
            .ok_or_else(|| invalid_session(session_id))
    }
}

// ============================================================================
// Test record
// ============================================================================

/// Per-test activities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestActivityKind {
    DataRequest,
    PostResults,
    GetFeedback,
    Completion,
}

/// Per-round entry inside a test activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundEntry {
    pub time: Vec<DateTime<Utc>>,
    /// Result types posted for the round, in posting order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<ResultType>,
    /// Ids served so far for the round, per feedback type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feedback: BTreeMap<FeedbackType, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_budget: Option<usize>,
}

/// One activity in a test record, optionally nested by round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestActivity {
    pub time: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rounds: BTreeMap<u32, RoundEntry>,
    #[serde(rename = "last round", default, skip_serializing_if = "Option::is_none")]
    pub last_round: Option<u32>,
    /// Artifact path per posted result type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<ResultType, PathBuf>,
}

impl TestActivity {
    /// Entry for a round, created on first access
    pub fn round_mut(&mut self, round_id: u32) -> &mut RoundEntry {
        self.rounds.entry(round_id).or_default()
    }

    /// Highest round recorded under this activity
    pub fn max_round(&self) -> Option<u32> {
        self.rounds.keys().next_back().copied()
    }
}

/// Persisted per-(session, test) log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_request: Option<TestActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_results: Option<TestActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_feedback: Option<TestActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<TestActivity>,
}

impl TestRecord {
    pub fn is_empty(&self) -> bool {
        self == &TestRecord::default()
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_some()
    }

    pub fn activity(&self, kind: TestActivityKind) -> Option<&TestActivity> {
        match kind {
            TestActivityKind::DataRequest => self.data_request.as_ref(),
            TestActivityKind::PostResults => self.post_results.as_ref(),
            TestActivityKind::GetFeedback => self.get_feedback.as_ref(),
            TestActivityKind::Completion => self.completion.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: TestActivityKind) -> &mut Option<TestActivity> {
        match kind {
            TestActivityKind::DataRequest => &mut self.data_request,
            TestActivityKind::PostResults => &mut self.post_results,
            TestActivityKind::GetFeedback => &mut self.get_feedback,
            TestActivityKind::Completion => &mut self.completion,
        }
    }

    /// Result types already posted for a round
    pub fn posted_types(&self, round_id: u32) -> &[ResultType] {
        self.post_results
            .as_ref()
            .and_then(|a| a.rounds.get(&round_id))
            .map(|r| r.types.as_slice())
            .unwrap_or(&[])
    }

    /// Most recent round with posted results
    pub fn last_posted_round(&self) -> Option<u32> {
        self.post_results.as_ref().and_then(TestActivity::max_round)
    }

    /// Artifact recorded for a result type, if one was ever posted
    pub fn result_file(&self, result_type: ResultType) -> Option<&Path> {
        self.post_results
            .as_ref()
            .and_then(|a| a.files.get(&result_type))
            .map(PathBuf::as_path)
    }

    /// Ids already served for a feedback type in a round
    pub fn feedback_served(&self, round_id: u32, feedback_type: FeedbackType) -> Option<usize> {
        self.get_feedback
            .as_ref()
            .and_then(|a| a.rounds.get(&round_id))
            .and_then(|r| r.feedback.get(&feedback_type).copied())
    }
}

fn invalid_session(session_id: &str) -> HarnessError {
    HarnessError::protocol(
        "session_id_invalid",
        format!("Provided session id {session_id} could not be found or was improperly set up"),
    )
}

// ============================================================================
// Store
// ============================================================================

/// File-backed lifecycle store rooted at the results directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> HarnessResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    pub fn test_path(&self, session_id: &str, test_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.{test_id}.json"))
    }

    /// Read the session record.
    ///
    /// A missing file reads as an empty record. With `in_process_only`, a
    /// terminated session fails with `SessionEnded`.
    pub fn session(&self, session_id: &str, in_process_only: bool) -> HarnessResult<SessionRecord> {
        let Some(record) = read_json::<SessionRecord>(&self.session_path(session_id))? else {
            return Ok(SessionRecord::default());
        };
        if record.is_terminated() && in_process_only {
            return Err(HarnessError::protocol(
                "SessionEnded",
                "The session being requested has already been terminated. \
                 Please either create a new session or request a different ID",
            ));
        }
        Ok(record)
    }

    /// Read the session record and require that it was created
    pub fn active_session(&self, session_id: &str) -> HarnessResult<SessionRecord> {
        let record = self.session(session_id, true)?;
        record.request(session_id)?;
        Ok(record)
    }

    /// Read the test record. A completed test fails with `TestCompleted`.
    pub fn test(&self, session_id: &str, test_id: &str) -> HarnessResult<TestRecord> {
        let record = read_json::<TestRecord>(&self.test_path(session_id, test_id))?
            .unwrap_or_default();
        if record.is_completed() {
            return Err(HarnessError::protocol(
                "TestCompleted",
                "The test being requested has already been completed for this session",
            ));
        }
        Ok(record)
    }

    /// Record a new session and return its id
    pub fn create_session(&self, request: SessionRequest) -> HarnessResult<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let record = SessionRecord {
            created: Some(CreatedActivity {
                time: vec![Utc::now()],
                request,
            }),
            ..Default::default()
        };
        write_json(&self.session_path(&session_id), &record)?;
        info!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Merge a test activity into the persisted test record.
    ///
    /// With a round, a time entry is appended to that round and the activity's
    /// `last round` marker moves to it. `update` then sees the activity with
    /// the round entry already present.
    pub fn record_test_activity<F>(
        &self,
        session_id: &str,
        test_id: &str,
        kind: TestActivityKind,
        round_id: Option<u32>,
        update: F,
    ) -> HarnessResult<TestRecord>
    where
        F: FnOnce(&mut TestActivity),
    {
        self.active_session(session_id)?;
        let mut record = self.test(session_id, test_id)?;
        let now = Utc::now();

        let activity = record.slot_mut(kind).get_or_insert_with(|| TestActivity {
            time: vec![now],
            ..Default::default()
        });
        if let Some(round_id) = round_id {
            activity.round_mut(round_id).time.push(now);
            activity.last_round = Some(round_id);
        }
        update(activity);

        write_json(&self.test_path(session_id, test_id), &record)?;
        debug!(session_id, test_id, ?kind, ?round_id, "Recorded test activity");
        Ok(record)
    }

    /// Mark a test complete. Completing an already completed test is a no-op.
    pub fn complete_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()> {
        let mut session = self.active_session(session_id)?;
        let mut record = read_json::<TestRecord>(&self.test_path(session_id, test_id))?
            .unwrap_or_default();
        if record.is_completed() {
            debug!(session_id, test_id, "Test already completed");
            return Ok(());
        }

        record.completion = Some(TestActivity {
            time: vec![Utc::now()],
            ..Default::default()
        });
        write_json(&self.test_path(session_id, test_id), &record)?;

        let tests = session.tests.get_or_insert_with(CompletedTests::default);
        if !tests.completed_tests.iter().any(|t| t == test_id) {
            tests.completed_tests.push(test_id.to_string());
        }
        write_json(&self.session_path(session_id), &session)?;
        info!(session_id, test_id, "Test completed");
        Ok(())
    }

    /// Terminate a session. Terminating twice keeps the first timestamp.
    pub fn terminate_session(&self, session_id: &str) -> HarnessResult<()> {
        let mut session = self.session(session_id, false)?;
        session.request(session_id)?;
        if session.is_terminated() {
            debug!(session_id, "Session already terminated");
            return Ok(());
        }
        session.termination = Some(ActivityStamp::now());
        write_json(&self.session_path(session_id), &session)?;
        info!(session_id, "Session terminated");
        Ok(())
    }

    /// Tests finished in a session, for resuming interrupted work
    pub fn finished_tests(&self, session_id: &str) -> HarnessResult<Vec<String>> {
        let session = self.active_session(session_id)?;
        Ok(session.completed_tests().to_vec())
    }

    /// Replace the session's pseudo-label assignment for a feedback type
    pub fn store_pseudo_labels(
        &self,
        session_id: &str,
        key: &str,
        labels: Vec<i64>,
    ) -> HarnessResult<()> {
        let mut session = self.active_session(session_id)?;
        session.pseudo_labels.insert(key.to_string(), labels);
        write_json(&self.session_path(session_id), &session)
    }

    /// Drop the test log of an abandoned run
    pub fn purge_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()> {
        let path = self.test_path(session_id, test_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!(session_id, test_id, "Purged stale test log");
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> HarnessResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&json).map_err(|e| {
        HarnessError::server(
            "CantReadFile",
            format!("session log {} is corrupt: {e}", path.display()),
        )
    })?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> HarnessResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
