//! Round dataset source
//!
//! Ground truth lives at `<data>/<protocol>/<domain>/<test>_single_df.csv`:
//! a header row, then one row per instance with the instance id first. Rows
//! are revealed in fixed-size rounds; round `r` is the half-open window
//! `[r * round_size, (r + 1) * round_size)` of the non-empty instance ids.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::ledger::ResultsLedger;
use crate::lifecycle::{SessionRequest, SessionStore, TestActivityKind};
use crate::metadata::load_metadata;

/// Quote character used by ground-truth files
pub const GROUND_TRUTH_QUOTE: char = '|';

/// Characters that make an instance id blank when they are all it has
const BLANK_ID_CHARS: &[char] = &['\n', '\t', '"', '\'', ',', '.', ' ', '\r'];

// ============================================================================
// CSV rows
// ============================================================================

/// Split one CSV line on commas, honoring an optional quote character.
///
/// Inside a quoted field a doubled quote is a literal quote.
pub fn split_row(line: &str, quote: Option<char>) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quote) {
            (c, Some(q)) if c == q => {
                if in_quotes && chars.peek() == Some(&q) {
                    field.push(q);
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            (',', _) if !in_quotes => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Read every non-empty line of a CSV file as fields
pub fn read_rows(path: &Path, quote: Option<char>, skip_header: bool) -> HarnessResult<Vec<Vec<String>>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .skip(usize::from(skip_header))
        .filter(|line| !line.trim().is_empty())
        .map(|line| split_row(line.trim_end_matches('\r'), quote))
        .collect())
}

/// Read a ground-truth file (header skipped, `|` quoting)
pub fn read_ground_truth(path: &Path) -> HarnessResult<Vec<Vec<String>>> {
    read_rows(path, Some(GROUND_TRUTH_QUOTE), true)
}

/// Instance ids of a ground-truth file, in dataset order
pub fn instance_ids(rows: &[Vec<String>]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.first())
        .filter(|id| !id.trim_matches(BLANK_ID_CHARS).is_empty())
        .cloned()
        .collect()
}

/// The window of ids belonging to a round, or `None` once the dataset is exhausted
pub fn round_window(ids: &[String], round_id: u32, round_size: usize) -> Option<&[String]> {
    let start = (round_id as usize).checked_mul(round_size)?;
    if round_size == 0 || start >= ids.len() {
        return None;
    }
    let end = (start + round_size).min(ids.len());
    Some(&ids[start..end])
}

/// Render ids as the newline-delimited round transport
pub fn render_round(ids: &[String]) -> String {
    let mut out = ids.join("\n");
    out.push('\n');
    out
}

/// Parse the round transport back into ids
pub fn parse_round(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn ground_truth_path(data_dir: &Path, protocol: &str, domain: &str, test_id: &str) -> PathBuf {
    data_dir
        .join(protocol)
        .join(domain)
        .join(format!("{test_id}_single_df.csv"))
}

// ============================================================================
// Source
// ============================================================================

/// Serves round slices of a test's dataset and records every request
#[derive(Debug, Clone)]
pub struct RoundDataSource {
    data_dir: PathBuf,
    store: SessionStore,
    ledger: ResultsLedger,
}

impl RoundDataSource {
    pub fn new(data_dir: impl Into<PathBuf>, store: SessionStore, ledger: ResultsLedger) -> Self {
        Self {
            data_dir: data_dir.into(),
            store,
            ledger,
        }
    }

    pub fn ground_truth_path(&self, request: &SessionRequest, test_id: &str) -> PathBuf {
        ground_truth_path(&self.data_dir, &request.protocol, &request.domain, test_id)
    }

    /// Ids for a round, or `None` when the test has no more rounds.
    ///
    /// Round 0 over a test with prior activity is a restart: the stale test
    /// log and result artifacts are purged before data is served.
    pub fn request_round(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
    ) -> HarnessResult<Option<Vec<String>>> {
        let session = self.store.active_session(session_id)?;
        let request = session.request(session_id)?;
        let test_record = self.store.test(session_id, test_id)?;

        let gt_path = self.ground_truth_path(request, test_id);
        if !gt_path.exists() {
            return Err(HarnessError::server(
                "test_id_invalid",
                format!("Test Id {test_id} could not be matched to a specific file"),
            ));
        }
        let metadata = load_metadata(&self.data_dir, request, test_id, false)?;

        if round_id == 0 && !test_record.is_empty() {
            info!(session_id, test_id, "Restarting test, purging stale artifacts");
            self.store.purge_test(session_id, test_id)?;
            self.ledger.purge(session_id, test_id, request)?;
        }

        let ids = instance_ids(&read_ground_truth(&gt_path)?);
        let round_size = metadata.require_round_size(test_id)?;
        let Some(window) = round_window(&ids, round_id, round_size) else {
            debug!(session_id, test_id, round_id, total = ids.len(), "Dataset exhausted");
            return Ok(None);
        };
        let window = window.to_vec();

        self.store.record_test_activity(
            session_id,
            test_id,
            TestActivityKind::DataRequest,
            Some(round_id),
            |_| {},
        )?;
        debug!(session_id, test_id, round_id, rows = window.len(), "Served round");
        Ok(Some(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_row_quotes() {
        assert_eq!(split_row("a,b,c", None), vec!["a", "b", "c"]);
        assert_eq!(
            split_row("id1,|hello, world|,3", Some('|')),
            vec!["id1", "hello, world", "3"]
        );
        assert_eq!(split_row("x,|a||b|", Some('|')), vec!["x", "a|b"]);
        assert_eq!(split_row("", None), vec![""]);
    }

    #[test]
    fn test_instance_ids_drop_blank_rows() {
        let rows = vec![
            vec!["a.png".to_string(), "1".to_string()],
            vec!["\"\"".to_string(), "2".to_string()],
            vec![" ".to_string()],
            vec!["b.png".to_string(), "0".to_string()],
        ];
        assert_eq!(instance_ids(&rows), vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_round_window_120_by_50() {
        let ids: Vec<String> = (0..120).map(|i| format!("id{i}")).collect();
        assert_eq!(round_window(&ids, 0, 50).unwrap().len(), 50);
        assert_eq!(round_window(&ids, 1, 50).unwrap().len(), 50);
        let last = round_window(&ids, 2, 50).unwrap();
        assert_eq!(last.len(), 20);
        assert_eq!(last[0], "id100");
        assert!(round_window(&ids, 3, 50).is_none());
    }

    #[test]
    fn test_round_window_exact_multiple() {
        let ids: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(round_window(&ids, 1, 50).unwrap().len(), 50);
        assert!(round_window(&ids, 2, 50).is_none());
        assert!(round_window(&ids, 0, 0).is_none());
    }

    #[test]
    fn test_round_transport() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let rendered = render_round(&ids);
        assert_eq!(rendered, "a\nb\n");
        assert_eq!(parse_round(&rendered), ids);
    }
}
