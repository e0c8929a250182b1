//! Client-side feedback budget
//!
//! The balance starts at `first`, grows by `income` (capped at `maximum`)
//! whenever a newer round is served and shrinks by the number of ids actually
//! requested. Requests for a round that was already served get nothing.

use std::sync::Arc;
use tracing::{debug, info};

use super::FeedbackRow;
use crate::error::HarnessResult;
use crate::harness::EvaluationHarness;
use crate::types::FeedbackType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackBudget {
    balance: usize,
    income: usize,
    maximum: usize,
    last_round: Option<u32>,
}

impl FeedbackBudget {
    pub fn new(first: usize, income: usize, maximum: usize) -> Self {
        Self {
            balance: first.min(maximum),
            income,
            maximum,
            last_round: None,
        }
    }

    /// Budget where first payment, income and cap are all `feedback_max_ids`
    pub fn uniform(feedback_max_ids: usize) -> Self {
        Self::new(feedback_max_ids, feedback_max_ids, feedback_max_ids)
    }

    pub fn balance(&self) -> usize {
        self.balance
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    pub fn last_round(&self) -> Option<u32> {
        self.last_round
    }

    /// Add one round of income, capped at the maximum
    pub fn deposit_income(&mut self) {
        self.balance = self.maximum.min(self.balance.saturating_add(self.income));
    }

    /// Move to `round_id`. Returns `false` when the round was already served.
    ///
    /// The first served round spends the initial balance; every later round
    /// deposits one income first.
    pub fn begin_round(&mut self, round_id: u32) -> bool {
        match self.last_round {
            Some(last) if round_id <= last => false,
            Some(_) => {
                self.deposit_income();
                self.last_round = Some(round_id);
                true
            }
            None => {
                self.last_round = Some(round_id);
                true
            }
        }
    }

    /// Take up to `requested` from the balance, returning what was granted
    pub fn withdraw(&mut self, requested: usize) -> usize {
        let granted = requested.min(self.balance);
        self.balance -= granted;
        granted
    }
}

/// Feedback handle given to an algorithm for one test
pub struct FeedbackClient {
    harness: Arc<dyn EvaluationHarness>,
    session_id: String,
    test_id: String,
    feedback_type: FeedbackType,
    budget: FeedbackBudget,
}

impl FeedbackClient {
    pub fn new(
        harness: Arc<dyn EvaluationHarness>,
        session_id: impl Into<String>,
        test_id: impl Into<String>,
        feedback_type: FeedbackType,
        budget: FeedbackBudget,
    ) -> Self {
        Self {
            harness,
            session_id: session_id.into(),
            test_id: test_id.into(),
            feedback_type,
            budget,
        }
    }

    pub fn feedback_type(&self) -> FeedbackType {
        self.feedback_type
    }

    pub fn budget(&self) -> &FeedbackBudget {
        &self.budget
    }

    /// Whether requests draw from the budget. Scores are free.
    pub fn is_budgeted(&self) -> bool {
        self.feedback_type != FeedbackType::Score
    }

    /// Request feedback for `ids` in `round_id`.
    ///
    /// Returns `None` when feedback for the round was already requested.
    /// Budgeted requests are clamped to the balance, in the order given.
    pub fn request(&mut self, round_id: u32, ids: &[String]) -> HarnessResult<Option<Vec<FeedbackRow>>> {
        if !self.budget.begin_round(round_id) {
            debug!(
                test_id = %self.test_id,
                round_id,
                "Feedback already requested for round"
            );
            return Ok(None);
        }

        let ids = if self.is_budgeted() {
            let granted = self.budget.withdraw(ids.len());
            if granted == 0 {
                info!(
                    test_id = %self.test_id,
                    round_id,
                    requested = ids.len(),
                    "Feedback budget exhausted for round"
                );
                return Ok(Some(Vec::new()));
            }
            &ids[..granted]
        } else {
            ids
        };

        let rows = self.harness.get_feedback_request(
            &self.session_id,
            &self.test_id,
            round_id,
            self.feedback_type,
            ids,
        )?;
        debug!(
            test_id = %self.test_id,
            round_id,
            feedback_type = %self.feedback_type,
            served = rows.len(),
            balance = self.budget.balance(),
            "Received feedback"
        );
        Ok(Some(rows))
    }
}

impl std::fmt::Debug for FeedbackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackClient")
            .field("session_id", &self.session_id)
            .field("test_id", &self.test_id)
            .field("feedback_type", &self.feedback_type)
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replenish_on_new_round() {
        let mut budget = FeedbackBudget::new(5, 5, 10);

        assert!(budget.begin_round(0));
        assert_eq!(budget.withdraw(5), 5);
        assert_eq!(budget.balance(), 0);

        assert!(budget.begin_round(1));
        assert_eq!(budget.balance(), 5);
        assert_eq!(budget.withdraw(3), 3);
        assert_eq!(budget.balance(), 2);
    }

    #[test]
    fn test_repeat_round_not_served() {
        let mut budget = FeedbackBudget::uniform(4);
        assert!(budget.begin_round(0));
        assert!(!budget.begin_round(0));
        assert!(budget.begin_round(2));
        assert!(!budget.begin_round(1));
        assert_eq!(budget.last_round(), Some(2));
    }

    #[test]
    fn test_balance_after_idle_rounds() {
        for (first, income, max) in [(0, 3, 10), (5, 5, 10), (2, 1, 4), (7, 0, 7)] {
            let mut budget = FeedbackBudget::new(first, income, max);
            budget.begin_round(0);
            for n in 1..=6u32 {
                assert!(budget.begin_round(n));
                let expected = max.min(first + n as usize * income);
                assert_eq!(budget.balance(), expected, "first={first} income={income} n={n}");
                assert!(budget.balance() <= budget.maximum());
            }
        }
    }

    #[test]
    fn test_withdraw_never_negative() {
        let mut budget = FeedbackBudget::new(3, 0, 3);
        assert_eq!(budget.withdraw(10), 3);
        assert_eq!(budget.withdraw(1), 0);
        assert_eq!(budget.balance(), 0);
    }

    #[test]
    fn test_first_capped_at_maximum() {
        let budget = FeedbackBudget::new(20, 1, 8);
        assert_eq!(budget.balance(), 8);
    }
}
