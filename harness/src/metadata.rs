//! Test metadata
//!
//! Each test ships a `<test>_metadata.json` next to its ground truth. The
//! API view only exposes an allow-list of keys; hints can override integer
//! values of allow-listed keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, HarnessResult};
use crate::lifecycle::{SessionRequest, RED_LIGHT_HINT};

/// Keys a client is allowed to see
pub const APPROVED_KEYS: [&str; 7] = [
    "protocol",
    "known_classes",
    "max_novel_classes",
    "round_size",
    "feedback_max_ids",
    "pre_novelty_batches",
    "max_detection_feedback_ids",
];

/// Test metadata as a JSON object with typed accessors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestMetadata(pub Map<String, Value>);

impl TestMetadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Non-negative integer value, accepting numeric strings
    pub fn get_usize(&self, key: &str) -> Option<usize> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64().map(|v| v as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn round_size(&self) -> Option<usize> {
        self.get_usize("round_size")
    }

    pub fn feedback_max_ids(&self) -> Option<usize> {
        self.get_usize("feedback_max_ids")
    }

    pub fn known_classes(&self) -> Option<i64> {
        match self.0.get("known_classes")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn pre_novelty_batches(&self) -> usize {
        self.get_usize("pre_novelty_batches").unwrap_or(0)
    }

    /// Instance id where the world changes, when the session may see it
    pub fn red_light(&self) -> Option<&str> {
        self.get_str("red_light").filter(|s| !s.is_empty())
    }

    /// Whether rounds restrict feedback to the latest posted round
    pub fn feedback_constrained(&self) -> bool {
        self.0
            .get("feedback_constrained")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Round size, or the `no_defined_rounds` round error
    pub fn require_round_size(&self, test_id: &str) -> HarnessResult<usize> {
        self.round_size().filter(|size| *size > 0).ok_or_else(|| {
            HarnessError::round(
                "no_defined_rounds",
                format!("round_size not defined in metadata for test id {test_id}"),
            )
        })
    }

    /// Keep allow-listed keys only
    pub fn approved(&self, allowed: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| allowed.iter().any(|a| a == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Allow-list for a session: the approved keys plus `red_light` in given mode
pub fn allowed_keys(request: &SessionRequest) -> Vec<String> {
    let mut keys: Vec<String> = APPROVED_KEYS.iter().map(|k| k.to_string()).collect();
    if request.is_red_light_mode() {
        keys.push(RED_LIGHT_HINT.to_string());
    }
    keys
}

pub fn metadata_path(data_dir: &Path, request: &SessionRequest, test_id: &str) -> PathBuf {
    data_dir
        .join(&request.protocol)
        .join(&request.domain)
        .join(format!("{test_id}_metadata.json"))
}

/// Load a test's metadata for a session.
///
/// Hint overrides apply to allow-listed keys. With `api_call`, the result is
/// filtered to the allow-list.
pub fn load_metadata(
    data_dir: &Path,
    request: &SessionRequest,
    test_id: &str,
    api_call: bool,
) -> HarnessResult<TestMetadata> {
    let path = metadata_path(data_dir, request, test_id);
    if !path.exists() {
        return Err(HarnessError::server(
            "metadata_not_found",
            format!("Metadata file for Test Id {test_id} could not be found"),
        ));
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut metadata: TestMetadata = serde_json::from_str(&raw).map_err(|e| {
        HarnessError::server(
            "metadata_not_found",
            format!("Metadata file for Test Id {test_id} is not a JSON object: {e}"),
        )
    })?;

    let allowed = allowed_keys(request);
    for (key, value) in request.hint_overrides() {
        if allowed.contains(&key) {
            metadata.0.insert(key, Value::from(value));
        }
    }

    if api_call {
        Ok(metadata.approved(&allowed))
    } else {
        Ok(metadata)
    }
}
