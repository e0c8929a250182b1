//! Checkpoint store
//!
//! Accumulates named algorithm attributes across the rounds of a test and
//! restores the slice that belongs to one round. The store wraps stage calls
//! from the outside; algorithms only expose their attributes through
//! [`Checkpointable`].
//!
//! On disk the accumulated values are one JSON file per test, shaped as
//! `{attribute: {test_id: value}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::types::Stage;

// ============================================================================
// Values
// ============================================================================

/// An attribute value and, through its variant, its accumulation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Replaced on every save
    Scalar(Value),
    /// Extended on every save
    Sequence(Vec<Value>),
    /// Fixed-size group, extended on every save
    Tuple(Vec<Value>),
    /// Keyed by instance id, key-union updated on every save
    Mapping(BTreeMap<String, Value>),
    /// Row-major numeric array, concatenated along the leading axis
    Tensor { shape: Vec<usize>, data: Vec<f64> },
}

impl AttributeValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Sequence(_) => "sequence",
            Self::Tuple(_) => "tuple",
            Self::Mapping(_) => "mapping",
            Self::Tensor { .. } => "tensor",
        }
    }

    /// Tensor data must hold exactly as many values as its shape describes
    pub fn check_shape(&self) -> HarnessResult<()> {
        let Self::Tensor { shape, data } = self else {
            return Ok(());
        };
        let expected = shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim));
        if expected != Some(data.len()) {
            return Err(HarnessError::server(
                "attribute_invalid",
                format!(
                    "Tensor of shape {shape:?} holds {} values",
                    data.len()
                ),
            ));
        }
        Ok(())
    }

    /// Merge `current` into the accumulated value
    pub fn accumulate(self, current: AttributeValue) -> HarnessResult<AttributeValue> {
        self.check_shape()?;
        current.check_shape()?;
        match (self, current) {
            (Self::Mapping(mut acc), Self::Mapping(cur)) => {
                acc.extend(cur);
                Ok(Self::Mapping(acc))
            }
            (Self::Sequence(mut acc), Self::Sequence(cur)) => {
                acc.extend(cur);
                Ok(Self::Sequence(acc))
            }
            (Self::Tuple(mut acc), Self::Tuple(cur)) => {
                acc.extend(cur);
                Ok(Self::Tuple(acc))
            }
            (
                Self::Tensor {
                    shape: mut acc_shape,
                    data: mut acc_data,
                },
                Self::Tensor { shape, data },
            ) if !acc_shape.is_empty() && !shape.is_empty() => {
                if acc_shape[1..] != shape[1..] {
                    return Err(HarnessError::not_implemented(format!(
                        "Cannot concatenate tensors of shape {acc_shape:?} and {shape:?}"
                    )));
                }
                acc_shape[0] += shape[0];
                acc_data.extend(data);
                Ok(Self::Tensor {
                    shape: acc_shape,
                    data: acc_data,
                })
            }
            (_, current) => {
                debug!(
                    kind = current.kind(),
                    "Treating attribute value as a single element"
                );
                Ok(current)
            }
        }
    }

    /// The part of the accumulated value that belongs to a round.
    ///
    /// Positional values yield `[round_id * len, (round_id + 1) * len)` with
    /// `len` the number of ids in the round; mappings keep only those ids.
    pub fn round_slice(&self, round_id: u32, ids: &[String]) -> HarnessResult<AttributeValue> {
        self.check_shape()?;
        let len = ids.len();
        let start = (round_id as usize).saturating_mul(len);
        let window = |total: usize| {
            let s = start.min(total);
            (s, start.saturating_add(len).min(total))
        };

        let sliced = match self {
            Self::Mapping(map) => Self::Mapping(
                ids.iter()
                    .filter_map(|id| map.get(id).map(|v| (id.clone(), v.clone())))
                    .collect(),
            ),
            Self::Sequence(values) => {
                let (s, e) = window(values.len());
                Self::Sequence(values[s..e].to_vec())
            }
            Self::Tuple(values) => {
                let (s, e) = window(values.len());
                Self::Tuple(values[s..e].to_vec())
            }
            Self::Tensor { shape, data } if !shape.is_empty() => {
                let row: usize = shape[1..].iter().product();
                let (s, e) = window(shape[0]);
                let mut sliced = shape.clone();
                sliced[0] = e - s;
                Self::Tensor {
                    shape: sliced,
                    data: data[s * row..e * row].to_vec(),
                }
            }
            other => other.clone(),
        };
        Ok(sliced)
    }
}

/// Attribute access for checkpointing
pub trait Checkpointable {
    /// Current value of a named attribute, `None` when the attribute does not exist
    fn attribute(&self, _name: &str) -> Option<AttributeValue> {
        None
    }

    fn set_attribute(&mut self, name: &str, _value: AttributeValue) -> HarnessResult<()> {
        Err(HarnessError::not_implemented(format!(
            "Attribute {name} cannot be restored"
        )))
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub save_attributes: bool,
    #[serde(default)]
    pub use_saved_attributes: bool,
    /// Attribute names saved after, and restored before, each stage
    #[serde(default)]
    pub saved_attributes: BTreeMap<Stage, Vec<String>>,
    #[serde(default)]
    pub save_elementwise: bool,
    /// Directory for per-test files, or a single `.json` file
    #[serde(default)]
    pub save_dir: PathBuf,
}

impl CheckpointConfig {
    pub fn is_enabled(&self) -> bool {
        self.save_attributes || self.use_saved_attributes
    }
}

type AttributeFile = BTreeMap<String, BTreeMap<String, AttributeValue>>;

#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    config: CheckpointConfig,
    accumulated: AttributeFile,
}

impl CheckpointStore {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            accumulated: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn attribute_path(&self, test_id: &str) -> PathBuf {
        attribute_path(&self.config.save_dir, test_id)
    }

    /// Accumulated value of an attribute for a test
    pub fn accumulated(&self, attribute: &str, test_id: &str) -> Option<&AttributeValue> {
        self.accumulated.get(attribute)?.get(test_id)
    }

    fn stage_attributes(&self, stage: Stage) -> &[String] {
        self.config
            .saved_attributes
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Merge the algorithm's attributes for `stage` into the accumulated record.
    ///
    /// Attributes the algorithm does not have are skipped with a warning.
    pub fn save_attributes<A: Checkpointable + ?Sized>(
        &mut self,
        test_id: &str,
        stage: Stage,
        algorithm: &A,
    ) -> HarnessResult<()> {
        if !self.config.save_attributes {
            return Ok(());
        }
        let names = self.stage_attributes(stage).to_vec();
        if names.is_empty() {
            debug!(%stage, "No attributes configured for stage");
            return Ok(());
        }

        for name in names {
            let Some(current) = algorithm.attribute(&name) else {
                warn!(%stage, attribute = %name, "Algorithm does not have attribute");
                continue;
            };
            if !self.config.save_elementwise {
                return Err(HarnessError::not_implemented(
                    "Saving attributes for an entire round is not supported",
                ));
            }
            let per_test = self.accumulated.entry(name.clone()).or_default();
            let merged = match per_test.remove(test_id) {
                Some(acc) => acc.accumulate(current)?,
                None => current,
            };
            per_test.insert(test_id.to_string(), merged);
            debug!(%stage, attribute = %name, test_id, "Saved attribute");
        }
        Ok(())
    }

    /// Set the round's slice of every attribute configured for `stage`
    pub fn restore_attributes<A: Checkpointable + ?Sized>(
        &self,
        test_id: &str,
        stage: Stage,
        round_id: u32,
        ids: &[String],
        algorithm: &mut A,
    ) -> HarnessResult<()> {
        if !self.config.use_saved_attributes {
            return Ok(());
        }
        let names = self.stage_attributes(stage);
        if names.is_empty() {
            debug!(%stage, "No attributes to restore for stage");
            return Ok(());
        }
        if !self.config.save_elementwise {
            return Err(HarnessError::not_implemented(
                "Restoring attributes for an entire round is not supported",
            ));
        }

        let path = self.attribute_path(test_id);
        let saved = load_attribute_file(&path)?;
        for name in names {
            let value = saved
                .get(name)
                .and_then(|per_test| per_test.get(test_id))
                .ok_or_else(|| {
                    HarnessError::server(
                        "attribute_not_found",
                        format!(
                            "No saved value for attribute {name} of test {test_id} in {}",
                            path.display()
                        ),
                    )
                })?;
            algorithm.set_attribute(name, value.round_slice(round_id, ids)?)?;
            debug!(%stage, attribute = %name, test_id, round_id, "Restored attribute");
        }
        Ok(())
    }

    /// Write the accumulated attributes of a test, when saving is enabled
    pub fn persist(&self, test_id: &str) -> HarnessResult<Option<PathBuf>> {
        if !self.config.save_attributes {
            return Ok(None);
        }
        let current: Vec<(&String, &AttributeValue)> = self
            .accumulated
            .iter()
            .filter_map(|(name, tests)| tests.get(test_id).map(|v| (name, v)))
            .collect();
        if current.is_empty() {
            return Ok(None);
        }

        let path = self.attribute_path(test_id);
        // A shared file holds every test; only this test's entries are replaced
        let mut file = if path.exists() {
            load_attribute_file(&path)?
        } else {
            AttributeFile::new()
        };
        for tests in file.values_mut() {
            tests.remove(test_id);
        }
        file.retain(|_, tests| !tests.is_empty());
        for (name, value) in current {
            file.entry(name.clone())
                .or_default()
                .insert(test_id.to_string(), value.clone());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, json)?;
        info!(test_id, path = %path.display(), "Saved attributes");
        Ok(Some(path))
    }
}

/// `<save_dir>/<test>_attribute.json`, or `save_dir` itself when it names a JSON file
pub fn attribute_path(save_dir: &Path, test_id: &str) -> PathBuf {
    if save_dir.extension().is_some_and(|ext| ext == "json") {
        save_dir.to_path_buf()
    } else {
        save_dir.join(format!("{test_id}_attribute.json"))
    }
}

fn load_attribute_file(path: &Path) -> HarnessResult<AttributeFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        HarnessError::server(
            "CantReadFile",
            format!("Couldn't open saved attributes at {}: {e}", path.display()),
        )
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Detector {
        attrs: BTreeMap<String, AttributeValue>,
    }

    impl Checkpointable for Detector {
        fn attribute(&self, name: &str) -> Option<AttributeValue> {
            self.attrs.get(name).cloned()
        }

        fn set_attribute(&mut self, name: &str, value: AttributeValue) -> HarnessResult<()> {
            self.attrs.insert(name.to_string(), value);
            Ok(())
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn config(dir: &Path) -> CheckpointConfig {
        CheckpointConfig {
            save_attributes: true,
            use_saved_attributes: true,
            saved_attributes: BTreeMap::from([(
                Stage::FeatureExtraction,
                vec!["dummy_list".to_string(), "dummy_dict".to_string()],
            )]),
            save_elementwise: true,
            save_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_restore_round_slice_of_list() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::new(config(dir.path()));
        let mut detector = Detector::default();

        for (round, values) in [[1, 2], [3, 4]].iter().enumerate() {
            detector.attrs.insert(
                "dummy_list".into(),
                AttributeValue::Sequence(values.iter().map(|v| json!(v)).collect()),
            );
            detector.attrs.insert(
                "dummy_dict".into(),
                AttributeValue::Mapping(BTreeMap::from([(format!("id{round}"), json!(round))])),
            );
            store
                .save_attributes("t1", Stage::FeatureExtraction, &detector)
                .unwrap();
        }
        assert_eq!(
            store.accumulated("dummy_list", "t1"),
            Some(&AttributeValue::Sequence(vec![json!(1), json!(2), json!(3), json!(4)]))
        );

        let path = store.persist("t1").unwrap().unwrap();
        assert_eq!(path, dir.path().join("t1_attribute.json"));

        let mut fresh = Detector::default();
        store
            .restore_attributes("t1", Stage::FeatureExtraction, 1, &ids(&["id1", "x"]), &mut fresh)
            .unwrap();
        assert_eq!(
            fresh.attrs["dummy_list"],
            AttributeValue::Sequence(vec![json!(3), json!(4)])
        );
        assert_eq!(
            fresh.attrs["dummy_dict"],
            AttributeValue::Mapping(BTreeMap::from([("id1".to_string(), json!(1))]))
        );
    }

    #[test]
    fn test_tensor_concatenates_on_leading_axis() {
        let a = AttributeValue::Tensor {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        let b = AttributeValue::Tensor {
            shape: vec![1, 2],
            data: vec![5.0, 6.0],
        };
        let merged = a.accumulate(b).unwrap();
        assert_eq!(
            merged,
            AttributeValue::Tensor {
                shape: vec![3, 2],
                data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            }
        );
        assert_eq!(
            merged.round_slice(1, &ids(&["x"])).unwrap(),
            AttributeValue::Tensor {
                shape: vec![1, 2],
                data: vec![3.0, 4.0],
            }
        );

        let bad = AttributeValue::Tensor {
            shape: vec![1, 3],
            data: vec![0.0; 3],
        };
        assert!(merged.accumulate(bad).is_err());
    }

    #[test]
    fn test_tensor_with_wrong_length_is_rejected() {
        let short = AttributeValue::Tensor {
            shape: vec![4, 2],
            data: vec![1.0, 2.0],
        };
        let err = short.round_slice(1, &ids(&["a", "b"])).unwrap_err();
        assert_eq!(err.reason(), Some("attribute_invalid"));

        let good = AttributeValue::Tensor {
            shape: vec![1, 2],
            data: vec![1.0, 2.0],
        };
        let err = good.clone().accumulate(short.clone()).unwrap_err();
        assert_eq!(err.reason(), Some("attribute_invalid"));
        assert!(short.accumulate(good).is_err());

        // Same failure when the bad value comes from disk
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.saved_attributes =
            BTreeMap::from([(Stage::FeatureExtraction, vec!["weights".to_string()])]);
        std::fs::write(
            dir.path().join("t1_attribute.json"),
            r#"{"weights": {"t1": {"kind": "tensor", "value": {"shape": [4, 2], "data": [1, 2]}}}}"#,
        )
        .unwrap();
        let store = CheckpointStore::new(cfg);
        let err = store
            .restore_attributes("t1", Stage::FeatureExtraction, 1, &ids(&["a", "b"]), &mut Detector::default())
            .unwrap_err();
        assert_eq!(err.reason(), Some("attribute_invalid"));
    }

    #[test]
    fn test_shared_file_keeps_every_test() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("all.json");
        let mut cfg = config(&shared);
        cfg.saved_attributes =
            BTreeMap::from([(Stage::FeatureExtraction, vec!["dummy_list".to_string()])]);
        let mut store = CheckpointStore::new(cfg);
        let mut detector = Detector::default();

        for (test, values) in [("t1", [1, 2]), ("t2", [3, 4])] {
            detector.attrs.insert(
                "dummy_list".into(),
                AttributeValue::Sequence(values.iter().map(|v| json!(v)).collect()),
            );
            store
                .save_attributes(test, Stage::FeatureExtraction, &detector)
                .unwrap();
            assert_eq!(store.persist(test).unwrap(), Some(shared.clone()));
        }

        for (test, first) in [("t1", 1), ("t2", 3)] {
            let mut fresh = Detector::default();
            store
                .restore_attributes(test, Stage::FeatureExtraction, 0, &ids(&["a"]), &mut fresh)
                .unwrap();
            assert_eq!(fresh.attrs["dummy_list"], AttributeValue::Sequence(vec![json!(first)]));
        }
    }

    #[test]
    fn test_scalar_and_mismatched_kinds_replace() {
        let merged = AttributeValue::Scalar(json!(1))
            .accumulate(AttributeValue::Scalar(json!(2)))
            .unwrap();
        assert_eq!(merged, AttributeValue::Scalar(json!(2)));

        let merged = AttributeValue::Sequence(vec![json!(1)])
            .accumulate(AttributeValue::Tuple(vec![json!(2)]))
            .unwrap();
        assert_eq!(merged, AttributeValue::Tuple(vec![json!(2)]));
    }

    #[test]
    fn test_missing_attribute_is_skipped() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::new(config(dir.path()));
        store
            .save_attributes("t1", Stage::FeatureExtraction, &Detector::default())
            .unwrap();
        assert!(store.persist("t1").unwrap().is_none());
    }

    #[test]
    fn test_whole_round_mode_not_implemented() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.save_elementwise = false;
        let mut store = CheckpointStore::new(cfg);

        let mut detector = Detector::default();
        detector
            .attrs
            .insert("dummy_list".into(), AttributeValue::Sequence(vec![json!(1)]));
        let err = store
            .save_attributes("t1", Stage::FeatureExtraction, &detector)
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotImplemented { .. }));

        let err = store
            .restore_attributes("t1", Stage::FeatureExtraction, 0, &ids(&["a"]), &mut detector)
            .unwrap_err();
        assert!(matches!(err, HarnessError::NotImplemented { .. }));
    }

    #[test]
    fn test_attribute_path_file_or_dir() {
        assert_eq!(
            attribute_path(Path::new("/tmp/attrs"), "t1"),
            PathBuf::from("/tmp/attrs/t1_attribute.json")
        );
        assert_eq!(
            attribute_path(Path::new("/tmp/all.json"), "t1"),
            PathBuf::from("/tmp/all.json")
        );
    }
}
