//! Per-test state machine
//!
//! A test moves `NotStarted → Initialized → RoundLoop → Characterizing →
//! Completed`, with `Failed` reachable from any non-terminal state. The
//! round loop re-enters itself once per round. Every transition is logged
//! with the round it happened in, so a run can be audited afterwards.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    NotStarted,
    /// Algorithm initialized for the test
    Initialized,
    /// Processing a round
    RoundLoop,
    /// Test-level characterization after the last round
    Characterizing,
    Completed,
    Failed,
}

impl TestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Initialized => write!(f, "Initialized"),
            Self::RoundLoop => write!(f, "RoundLoop"),
            Self::Characterizing => write!(f, "Characterizing"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal edges:
/// ```text
/// NotStarted → Initialized
/// Initialized → RoundLoop | Characterizing
/// RoundLoop → RoundLoop | Characterizing
/// Characterizing → Completed
/// ```
fn is_legal_transition(from: TestState, to: TestState) -> bool {
    use TestState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (NotStarted, Initialized)
            | (Initialized, RoundLoop)
            | (Initialized, Characterizing)
            | (RoundLoop, RoundLoop)
            | (RoundLoop, Characterizing)
            | (Characterizing, Completed)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TestState,
    pub to: TestState,
    /// Round being processed at the time of the transition
    pub round: u32,
    /// Milliseconds since the test started
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct TestStateMachine {
    current: TestState,
    round: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self {
            current: TestState::NotStarted,
            round: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> TestState {
        self.current
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    /// Move to `to`, rejecting edges outside the state graph
    pub fn advance(&mut self, to: TestState, reason: Option<&str>) -> HarnessResult<()> {
        if !is_legal_transition(self.current, to) {
            return Err(HarnessError::InvalidStateTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }

        tracing::debug!(from = %self.current, to = %to, round = self.round, "Test state transition");

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            round: self.round,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> HarnessResult<()> {
        self.advance(TestState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    pub fn summary(&self) -> String {
        format!(
            "{} → {} ({}ms, {} transitions, {} rounds)",
            TestState::NotStarted,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
            self.transitions
                .iter()
                .filter(|t| t.to == TestState::RoundLoop)
                .count(),
        )
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = TestStateMachine::new();
        assert_eq!(sm.current(), TestState::NotStarted);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path_with_rounds() {
        let mut sm = TestStateMachine::new();
        sm.advance(TestState::Initialized, None).unwrap();
        for round in 0..3 {
            sm.set_round(round);
            sm.advance(TestState::RoundLoop, None).unwrap();
        }
        sm.advance(TestState::Characterizing, Some("end of dataset")).unwrap();
        sm.advance(TestState::Completed, None).unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 6);
        assert_eq!(sm.transitions()[3].round, 2);
        assert_eq!(sm.transitions()[4].reason.as_deref(), Some("end of dataset"));
        assert!(sm.summary().contains("3 rounds"));
    }

    #[test]
    fn test_failure_from_any_non_terminal_state() {
        for state in [
            TestState::NotStarted,
            TestState::Initialized,
            TestState::RoundLoop,
            TestState::Characterizing,
        ] {
            let mut sm = TestStateMachine {
                current: state,
                round: 0,
                created_at: Instant::now(),
                transitions: Vec::new(),
            };
            sm.fail("server error").unwrap();
            assert_eq!(sm.current(), TestState::Failed);
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut sm = TestStateMachine::new();
        let err = sm.advance(TestState::RoundLoop, None).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidStateTransition { .. }));

        sm.advance(TestState::Initialized, None).unwrap();
        assert!(sm.advance(TestState::Completed, None).is_err());
        assert!(sm.advance(TestState::NotStarted, None).is_err());
        // A test without data goes straight to characterization
        sm.advance(TestState::Characterizing, None).unwrap();
        assert!(sm.advance(TestState::RoundLoop, None).is_err());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut sm = TestStateMachine::new();
        sm.fail("bad metadata").unwrap();
        assert!(sm.fail("again").is_err());
        assert!(sm.advance(TestState::Initialized, None).is_err());
    }

    #[test]
    fn test_transition_record_serde() {
        let record = TransitionRecord {
            from: TestState::RoundLoop,
            to: TestState::Characterizing,
            round: 4,
            elapsed_ms: 12,
            reason: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("round_loop"));
        assert!(!json.contains("reason"));
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }
}
