//! Round-based novelty detection evaluation harness
//!
//! An evaluation service and its client: sessions and tests are tracked in
//! a durable lifecycle store, test data is served round by round, results
//! are posted to a ledger and feedback is metered by budget. The protocol
//! drivers run novelty detection algorithms through these rounds, either
//! in-process ([`harness::LocalHarness`]) or against a remote service
//! ([`harness::ParHarness`]).

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod feedback;
pub mod harness;
pub mod ledger;
pub mod lifecycle;
pub mod metadata;
pub mod protocol;
pub mod provider;
pub mod retry;
pub mod types;

pub use error::{HarnessError, HarnessResult};
pub use harness::{EvaluationHarness, LocalHarness, ParHarness, RoundData};
pub use types::{Domain, FeedbackType, ProtocolKind, ResultType, Stage};
