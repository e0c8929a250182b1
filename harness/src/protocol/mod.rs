//! Protocol drivers
//!
//! The round/test skeleton shared by both variants, the OND and CONDDA
//! specializations and the session-level runner on top of them.

pub mod algorithm;
pub mod condda;
pub mod features;
pub mod ond;
pub mod round;
pub mod session;
pub mod state_machine;

pub use algorithm::{
    FeatureExtractionParams, InitializeParams, NoveltyAdaptationParams, NoveltyAlgorithm,
    NoveltyCharacterizationParams, NoveltyClassificationParams, RoundFeatures,
    WorldDetectionParams,
};
pub use condda::Condda;
pub use features::FeatureSettings;
pub use ond::Ond;
pub use round::{RoundProtocol, TestDriver, TestOutcome};
pub use session::{
    AlgorithmAttributes, AlgorithmReport, ProtocolConfig, ProtocolRunner, RegisteredAlgorithm,
};
pub use state_machine::{TestState, TestStateMachine, TransitionRecord};
