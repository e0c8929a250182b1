//! Ground-truth backed feedback computations
//!
//! Every computation returns rows in ground-truth (or result) order. Values
//! index the ground-truth row after its id column.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::FeedbackRow;
use crate::dataset::read_rows;
use crate::error::{HarnessError, HarnessResult};
use crate::metadata::TestMetadata;

/// Characters trimmed from every feedback field
const FIELD_TRIM: &[char] = &[' ', '"', '\''];

/// Keyed rows read from a ground-truth or result file
pub type KeyedRows = Vec<(String, Vec<String>)>;

/// Inputs shared by every computation
pub struct FeedbackInput<'a> {
    pub ground_truth: &'a [Vec<String>],
    pub result_file: &'a Path,
    pub metadata: &'a TestMetadata,
    pub columns: &'a [usize],
    /// Requested ids; empty means "the last posted round"
    pub ids: &'a [String],
}

/// Key rows by their first field.
///
/// With `constrained` (and unless the test opts out of constrained feedback)
/// only the trailing `round_size` rows, the latest round, are considered.
pub fn keyed_rows(
    rows: &[Vec<String>],
    ids: Option<&[String]>,
    metadata: &TestMetadata,
    constrained: bool,
) -> HarnessResult<KeyedRows> {
    let window = if constrained && metadata.feedback_constrained() {
        let round_size = metadata.round_size().ok_or_else(|| {
            HarnessError::round("no_defined_rounds", "round_size not defined in metadata.")
        })?;
        &rows[rows.len().saturating_sub(round_size)..]
    } else {
        rows
    };

    Ok(window
        .iter()
        .filter_map(|row| {
            let mut fields = row.iter().map(|f| f.trim_matches(FIELD_TRIM).to_string());
            let id = fields.next()?;
            Some((id, fields.collect::<Vec<_>>()))
        })
        .filter(|(id, _)| ids.map_or(true, |wanted| wanted.contains(id)))
        .collect())
}

fn read_results(path: &Path) -> HarnessResult<Vec<Vec<String>>> {
    read_rows(path, None, false).map_err(|e| {
        HarnessError::server(
            "CantReadFile",
            format!("Couldn't read posted results at {}: {e}", path.display()),
        )
    })
}

fn column<'a>(id: &str, values: &'a [String], col: usize) -> HarnessResult<&'a str> {
    values.get(col).map(String::as_str).ok_or_else(|| {
        HarnessError::server(
            "MalformedGroundTruth",
            format!("ground truth for {id} has no column {col}"),
        )
    })
}

fn int_column(id: &str, values: &[String], col: usize) -> HarnessResult<i64> {
    let raw = column(id, values, col)?;
    raw.parse::<f64>().map(|v| v as i64).map_err(|_| {
        HarnessError::server(
            "MalformedGroundTruth",
            format!("ground truth for {id} column {col} is not a label: {raw}"),
        )
    })
}

fn first_column(columns: &[usize]) -> HarnessResult<usize> {
    columns.first().copied().ok_or_else(|| {
        HarnessError::server("feedback_type_invalid", "feedback definition has no columns")
    })
}

/// Ids of the latest posted round, capped at `cap`
fn last_round_ids(input: &FeedbackInput<'_>, cap: Option<usize>) -> HarnessResult<Vec<String>> {
    let results = keyed_rows(&read_results(input.result_file)?, None, input.metadata, true)?;
    let cap = cap.unwrap_or(results.len()).min(results.len());
    Ok(results.into_iter().take(cap).map(|(id, _)| id).collect())
}

/// Ground-truth rows for explicit ids, or for the latest round when none were given
fn ground_truth_for(input: &FeedbackInput<'_>, ids: &[String]) -> HarnessResult<KeyedRows> {
    keyed_rows(input.ground_truth, Some(ids), input.metadata, ids.is_empty())
}

/// Ground-truth label per id, clamped to the number of known classes
pub fn classification(input: &FeedbackInput<'_>) -> HarnessResult<Vec<FeedbackRow>> {
    let ids = if input.ids.is_empty() {
        last_round_ids(input, input.metadata.feedback_max_ids())?
    } else {
        input.ids.to_vec()
    };
    let col = first_column(input.columns)?;
    let known = input.metadata.known_classes();

    ground_truth_for(input, &ids)?
        .into_iter()
        .map(|(id, values)| {
            let label = int_column(&id, &values, col)?;
            let label = known.map_or(label, |k| label.min(k));
            Ok(FeedbackRow::new(id, vec![label.to_string()]))
        })
        .collect()
}

/// Ground-truth column span `[columns[0], columns[1])` per id
pub fn classification_range(input: &FeedbackInput<'_>) -> HarnessResult<Vec<FeedbackRow>> {
    let (start, end) = match input.columns {
        [start, end, ..] => (*start, *end),
        _ => {
            return Err(HarnessError::server(
                "feedback_type_invalid",
                "range feedback needs a start and end column",
            ))
        }
    };
    ground_truth_for(input, input.ids)?
        .into_iter()
        .map(|(id, values)| {
            let end = end.min(values.len());
            let span = values.get(start..end).unwrap_or(&[]).to_vec();
            Ok(FeedbackRow::new(id, span))
        })
        .collect()
}

/// Ground-truth detection column per id
pub fn detection(input: &FeedbackInput<'_>) -> HarnessResult<Vec<FeedbackRow>> {
    let ids = if input.ids.is_empty() {
        last_round_ids(input, None)?
    } else {
        input.ids.to_vec()
    };
    let col = first_column(input.columns)?;
    ground_truth_for(input, &ids)?
        .into_iter()
        .map(|(id, values)| {
            let value = column(&id, &values, col)?.to_string();
            Ok(FeedbackRow::new(id, vec![value]))
        })
        .collect()
}

/// Accuracy of arg-max predictions over every posted classification
pub fn score(input: &FeedbackInput<'_>) -> HarnessResult<Vec<FeedbackRow>> {
    let col = first_column(input.columns)?;
    let ground_truth = keyed_rows(input.ground_truth, None, input.metadata, false)?;
    let results = keyed_rows(&read_results(input.result_file)?, None, input.metadata, false)?;

    let mut correct = 0usize;
    for (id, probs) in &results {
        let predicted = argmax(probs);
        let Some((_, truth)) = ground_truth.iter().find(|(gt_id, _)| gt_id == id) else {
            continue;
        };
        if predicted == Some(int_column(id, truth, col)?) {
            correct += 1;
        }
    }

    let accuracy = if results.is_empty() {
        0.0
    } else {
        correct as f64 / results.len() as f64
    };
    Ok(vec![FeedbackRow::new("accuracy", vec![accuracy.to_string()])])
}

fn argmax(values: &[String]) -> Option<i64> {
    values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.parse::<f64>().ok().map(|v| (i, v)))
        .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i as i64)
}

static NON_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("NON_WORD_RE regex should compile"));

/// Normalize a transcript: drop `;`, `"` and `|`, then space-separate words
/// from punctuation runs.
pub fn normalize_transcript(raw: &str) -> String {
    let cleaned = raw
        .replace([';', '"', '|'], "")
        .replace("  ", " ");
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in NON_WORD_RE.find_iter(&cleaned) {
        pieces.push(cleaned[last..m.start()].trim());
        pieces.push(m.as_str().trim());
        last = m.end();
    }
    pieces.push(cleaned[last..].trim());
    pieces.join(" ")
}

/// Character-level edit distance
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit distance between each posted transcription and the ground truth columns
pub fn transcription(input: &FeedbackInput<'_>) -> HarnessResult<Vec<FeedbackRow>> {
    let wanted = (!input.ids.is_empty()).then_some(input.ids);
    let ground_truth = keyed_rows(input.ground_truth, wanted, input.metadata, false)?;
    let results = keyed_rows(&read_results(input.result_file)?, wanted, input.metadata, true)?;

    results
        .into_iter()
        .map(|(id, predicted)| {
            let truth = ground_truth
                .iter()
                .find(|(gt_id, _)| *gt_id == id)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    HarnessError::server(
                        "MissingIds",
                        format!("{id} is missing from the ground truth"),
                    )
                })?;
            let predicted = normalize_transcript(predicted.first().map(String::as_str).unwrap_or(""));
            let distances = input
                .columns
                .iter()
                .map(|col| {
                    let expected = normalize_transcript(column(&id, truth, *col)?);
                    Ok(levenshtein(&expected, &predicted).to_string())
                })
                .collect::<HarnessResult<Vec<_>>>()?;
            Ok(FeedbackRow::new(id, distances))
        })
        .collect()
}

/// Renumber ground-truth labels by first appearance.
///
/// `labels` is the session's running assignment; newly seen labels are appended.
pub fn pseudo_labels(input: &FeedbackInput<'_>, labels: &mut Vec<i64>) -> HarnessResult<Vec<FeedbackRow>> {
    let col = first_column(input.columns)?;
    let wanted = (!input.ids.is_empty()).then_some(input.ids);
    keyed_rows(input.ground_truth, wanted, input.metadata, true)?
        .into_iter()
        .map(|(id, values)| {
            let label = int_column(&id, &values, col)?;
            let index = match labels.iter().position(|l| *l == label) {
                Some(index) => index,
                None => {
                    labels.push(label);
                    labels.len() - 1
                }
            };
            Ok(FeedbackRow::new(id, vec![index.to_string()]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn metadata(value: serde_json::Value) -> TestMetadata {
        serde_json::from_value(value).unwrap()
    }

    fn rows(lines: &[&str]) -> Vec<Vec<String>> {
        lines
            .iter()
            .map(|l| l.split(',').map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_keyed_rows_constrained_window() {
        let gt = rows(&["a,1", "b,2", "c,3", "d,4"]);
        let md = metadata(json!({"round_size": 2}));
        let last = keyed_rows(&gt, None, &md, true).unwrap();
        assert_eq!(last.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), vec!["c", "d"]);

        let all = keyed_rows(&gt, None, &md, false).unwrap();
        assert_eq!(all.len(), 4);

        let md = metadata(json!({"round_size": 2, "feedback_constrained": false}));
        assert_eq!(keyed_rows(&gt, None, &md, true).unwrap().len(), 4);

        let err = keyed_rows(&gt, None, &TestMetadata::default(), true).unwrap_err();
        assert!(err.is_round_end());
    }

    #[test]
    fn test_classification_clamps_known_classes() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("cls.csv");
        std::fs::write(&results, "a,0.1,0.9\nb,0.8,0.2\n").unwrap();
        let gt = rows(&["a,x,3", "b,x,9"]);
        let md = metadata(json!({"round_size": 2, "known_classes": 5}));
        let ids = vec!["a".to_string(), "b".to_string()];

        let out = classification(&FeedbackInput {
            ground_truth: &gt,
            result_file: &results,
            metadata: &md,
            columns: &[1],
            ids: &ids,
        })
        .unwrap();
        assert_eq!(out[0], FeedbackRow::new("a", vec!["3".into()]));
        assert_eq!(out[1], FeedbackRow::new("b", vec!["5".into()]));
    }

    #[test]
    fn test_classification_defaults_to_last_round_capped() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("cls.csv");
        std::fs::write(&results, "a,1\nb,1\nc,1\nd,1\n").unwrap();
        let gt = rows(&["a,x,0", "b,x,1", "c,x,2", "d,x,3"]);
        let md = metadata(json!({"round_size": 2, "known_classes": 9, "feedback_max_ids": 1}));

        let out = classification(&FeedbackInput {
            ground_truth: &gt,
            result_file: &results,
            metadata: &md,
            columns: &[1],
            ids: &[],
        })
        .unwrap();
        assert_eq!(out, vec![FeedbackRow::new("c", vec!["2".into()])]);
    }

    #[test]
    fn test_score_accuracy() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("cls.csv");
        std::fs::write(&results, "a,0.1,0.9\nb,0.8,0.2\n").unwrap();
        let gt = rows(&["a,x,1", "b,x,1"]);
        let md = metadata(json!({"round_size": 2}));

        let out = score(&FeedbackInput {
            ground_truth: &gt,
            result_file: &results,
            metadata: &md,
            columns: &[1],
            ids: &[],
        })
        .unwrap();
        assert_eq!(out, vec![FeedbackRow::new("accuracy", vec!["0.5".into()])]);
    }

    #[test]
    fn test_range_feedback() {
        let gt = rows(&["a,0,1,2,3,4,5,6,7,8,9,10"]);
        let md = metadata(json!({"round_size": 1}));
        let ids = vec!["a".to_string()];
        let out = classification_range(&FeedbackInput {
            ground_truth: &gt,
            result_file: Path::new("unused"),
            metadata: &md,
            columns: &[5, 10],
            ids: &ids,
        })
        .unwrap();
        assert_eq!(out[0].values, vec!["5", "6", "7", "8", "9"]);
    }

    #[test]
    fn test_normalize_and_levenshtein() {
        assert_eq!(normalize_transcript("hello, world"), "hello , world");
        assert_eq!(normalize_transcript("a;b"), "ab");
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_transcription_distance() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("tr.csv");
        std::fs::write(&results, "doc1,hello world\n").unwrap();
        let gt = rows(&["doc1,hello word"]);
        let md = metadata(json!({"round_size": 1}));
        let out = transcription(&FeedbackInput {
            ground_truth: &gt,
            result_file: &results,
            metadata: &md,
            columns: &[0],
            ids: &[],
        })
        .unwrap();
        assert_eq!(out, vec![FeedbackRow::new("doc1", vec!["1".into()])]);
    }

    #[test]
    fn test_pseudo_labels_first_seen_order() {
        let gt = rows(&["a,7", "b,3", "c,7"]);
        let md = metadata(json!({"round_size": 3}));
        let mut labels = vec![3];
        let out = pseudo_labels(
            &FeedbackInput {
                ground_truth: &gt,
                result_file: Path::new("unused"),
                metadata: &md,
                columns: &[0],
                ids: &[],
            },
            &mut labels,
        )
        .unwrap();
        let values: Vec<_> = out.iter().map(|r| r.values[0].as_str()).collect();
        assert_eq!(values, vec!["1", "0", "1"]);
        assert_eq!(labels, vec![3, 7]);
    }
}
