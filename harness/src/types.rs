//! Core vocabulary for the round protocol
//!
//! Protocol variants, domains, result and feedback kinds, gating rules and
//! the closed set of pipeline stages an algorithm is driven through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// Evaluation protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Open-world novelty detection: detection, classification, feedback, adaptation
    #[serde(rename = "OND")]
    Ond,
    /// Continual open-world novelty discovery: detection and per-round characterization
    #[serde(rename = "CONDDA")]
    Condda,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ond => "OND",
            Self::Condda => "CONDDA",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OND" => Ok(Self::Ond),
            "CONDDA" => Ok(Self::Condda),
            other => Err(HarnessError::config(format!("unknown protocol: {other}"))),
        }
    }
}

/// Problem domains with a feedback definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    ImageClassification,
    Transcripts,
    ActivityRecognition,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageClassification => "image_classification",
            Self::Transcripts => "transcripts",
            Self::ActivityRecognition => "activity_recognition",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image_classification" => Ok(Self::ImageClassification),
            "transcripts" => Ok(Self::Transcripts),
            "activity_recognition" => Ok(Self::ActivityRecognition),
            other => Err(HarnessError::protocol(
                "BadDomain",
                format!("domain {other} does not match a known domain type"),
            )),
        }
    }
}

/// Kind of result file posted for a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Detection,
    Classification,
    Characterization,
    Transcription,
}

impl ResultType {
    pub const ALL: [ResultType; 4] = [
        Self::Detection,
        Self::Classification,
        Self::Characterization,
        Self::Transcription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Classification => "classification",
            Self::Characterization => "characterization",
            Self::Transcription => "transcription",
        }
    }

    /// Single-post types may be posted at most once per round. Detection is
    /// the only one: feedback gating reads it.
    pub fn is_single_post(&self) -> bool {
        matches!(self, Self::Detection)
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultType {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                HarnessError::protocol("InvalidResultType", format!("unknown result type: {s}"))
            })
    }
}

/// Kind of feedback an algorithm may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Classification,
    Score,
    Detection,
    Transcription,
    #[serde(rename = "pseudo_labels_classification")]
    PseudoClassification,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Score => "score",
            Self::Detection => "detection",
            Self::Transcription => "transcription",
            Self::PseudoClassification => "pseudo_labels_classification",
        }
    }
}

impl fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackType {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Self::Classification),
            "score" => Ok(Self::Score),
            "detection" => Ok(Self::Detection),
            "transcription" => Ok(Self::Transcription),
            "pseudo_labels_classification" => Ok(Self::PseudoClassification),
            other => Err(HarnessError::protocol(
                "InvalidFeedbackType",
                format!("unknown feedback type: {other}"),
            )),
        }
    }
}

/// What to do when feedback is requested before novelty was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionRequirement {
    /// No gating
    Ignore,
    /// Log an error, then serve anyway
    NotifyAndContinue,
    /// Warn and serve nothing
    Skip,
    /// Fail with `NoveltyDetectionRequired`
    Required,
}

/// Pipeline stages, in the order a round invokes them.
///
/// `CreateFeedbackInstance` and `SaveFeatures` are harness-side stages; they
/// never reach the algorithm but can be skipped like any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    CreateFeedbackInstance,
    Initialize,
    FeatureExtraction,
    WorldDetection,
    NoveltyClassification,
    NoveltyAdaptation,
    NoveltyCharacterization,
    SaveFeatures,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Self::CreateFeedbackInstance,
        Self::Initialize,
        Self::FeatureExtraction,
        Self::WorldDetection,
        Self::NoveltyClassification,
        Self::NoveltyAdaptation,
        Self::NoveltyCharacterization,
        Self::SaveFeatures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateFeedbackInstance => "CreateFeedbackInstance",
            Self::Initialize => "Initialize",
            Self::FeatureExtraction => "FeatureExtraction",
            Self::WorldDetection => "WorldDetection",
            Self::NoveltyClassification => "NoveltyClassification",
            Self::NoveltyAdaptation => "NoveltyAdaptation",
            Self::NoveltyCharacterization => "NoveltyCharacterization",
            Self::SaveFeatures => "SaveFeatures",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| HarnessError::config(format!("unknown stage: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("ond".parse::<ProtocolKind>().unwrap(), ProtocolKind::Ond);
        assert_eq!("CONDDA".parse::<ProtocolKind>().unwrap(), ProtocolKind::Condda);
        assert!("svo".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_unknown_domain_is_bad_domain() {
        let err = "speech".parse::<Domain>().unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(err.reason(), Some("BadDomain"));
    }

    #[test]
    fn test_only_detection_is_single_post() {
        let single: Vec<_> = ResultType::ALL
            .into_iter()
            .filter(ResultType::is_single_post)
            .collect();
        assert_eq!(single, vec![ResultType::Detection]);
    }

    #[test]
    fn test_stage_serde_names_match_display() {
        for stage in Stage::ALL {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{stage}\""));
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_feedback_type_wire_names() {
        let ft: FeedbackType = serde_json::from_str("\"pseudo_labels_classification\"").unwrap();
        assert_eq!(ft, FeedbackType::PseudoClassification);
        let err = "characterization".parse::<FeedbackType>().unwrap_err();
        assert_eq!(err.reason(), Some("InvalidFeedbackType"));
    }
}
