//! Results ledger
//!
//! Posted results are appended to one artifact per (session, test, result
//! type) at `<results>/<protocol>/<domain>/<session>.<test>_<type>.csv`, and
//! the posted types are recorded per round in the test log.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::lifecycle::{SessionRequest, SessionStore, TestActivityKind};
use crate::types::ResultType;

#[derive(Debug, Clone)]
pub struct ResultsLedger {
    store: SessionStore,
}

impl ResultsLedger {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Deterministic artifact location for a result type
    pub fn artifact_path(
        &self,
        request: &SessionRequest,
        session_id: &str,
        test_id: &str,
        result_type: ResultType,
    ) -> PathBuf {
        self.store
            .root()
            .join(&request.protocol)
            .join(&request.domain)
            .join(format!("{session_id}.{test_id}_{result_type}.csv"))
    }

    /// Append results for a round.
    ///
    /// Fails with `DetectionRepost` when a single-post type was already posted
    /// for the round; nothing from the call is written in that case.
    pub fn post_results(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        results: &BTreeMap<ResultType, String>,
    ) -> HarnessResult<()> {
        if results.is_empty() {
            return Err(HarnessError::protocol(
                "MissingResults",
                "Must provide at least one result file",
            ));
        }

        let session = self.store.active_session(session_id)?;
        let request = session.request(session_id)?;
        let record = self.store.test(session_id, test_id)?;

        let posted = record.posted_types(round_id);
        if let Some(repost) = results
            .keys()
            .find(|t| t.is_single_post() && posted.contains(*t))
        {
            return Err(HarnessError::protocol(
                "DetectionRepost",
                format!(
                    "Cannot re post {repost} for round {round_id}. If you attempted to \
                     submit any other results, please resubmit without {repost}."
                ),
            ));
        }

        let mut appended = Vec::new();
        let outcome = self
            .append_results(request, session_id, test_id, results, &mut appended)
            .and_then(|files| {
                self.store.record_test_activity(
                    session_id,
                    test_id,
                    TestActivityKind::PostResults,
                    Some(round_id),
                    |activity| {
                        activity.files.extend(files);
                        activity.round_mut(round_id).types.extend(results.keys().copied());
                    },
                )
            });
        if let Err(e) = outcome {
            roll_back(&appended);
            return Err(e);
        }
        debug!(
            session_id,
            test_id,
            round_id,
            types = ?results.keys().collect::<Vec<_>>(),
            "Posted results"
        );
        Ok(())
    }

    /// Append each result to its artifact, noting every file's prior length in `appended`
    fn append_results(
        &self,
        request: &SessionRequest,
        session_id: &str,
        test_id: &str,
        results: &BTreeMap<ResultType, String>,
        appended: &mut Vec<(PathBuf, Option<u64>)>,
    ) -> HarnessResult<BTreeMap<ResultType, PathBuf>> {
        let mut files = BTreeMap::new();
        for (result_type, content) in results {
            let path = self.artifact_path(request, session_id, test_id, *result_type);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let previous = std::fs::metadata(&path).ok().map(|m| m.len());
            appended.push((path.clone(), previous));
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(content.as_bytes())?;
            files.insert(*result_type, path);
        }
        Ok(files)
    }

    /// Remove every result artifact of a (session, test) pair
    pub fn purge(&self, session_id: &str, test_id: &str, request: &SessionRequest) -> HarnessResult<()> {
        for result_type in ResultType::ALL {
            let path = self.artifact_path(request, session_id, test_id, result_type);
            if path.exists() {
                std::fs::remove_file(&path)?;
                info!(session_id, test_id, path = %path.display(), "Removed stale result file");
            }
        }
        Ok(())
    }
}

/// Truncate files back to their prior length, deleting the ones that did not exist
fn roll_back(appended: &[(PathBuf, Option<u64>)]) {
    for (path, previous) in appended {
        let result = match previous {
            Some(len) => OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(*len)),
            None => std::fs::remove_file(path),
        };
        if let Err(e) = result {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Could not roll back result file");
            }
        }
    }
}
