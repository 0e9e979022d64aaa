//! Generic bounded repair/review loop.
//!
//! Every repair-then-reverify pattern in the engine (phase-output repair,
//! multi-step review adjudication) runs through [`CycleController`] instead
//! of ad hoc loop logic. The controller invokes an attempt function up to a
//! fixed number of cycles and never retries past exhaustion; the caller owns
//! what happens next (typically escalation).

use std::future::Future;

use serde::{Deserialize, Serialize};

/// Result of one attempt inside a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CycleVerdict {
    /// The attempt succeeded; the loop stops.
    Pass,
    /// The attempt failed in a fixable way; the loop continues.
    Concern { detail: String },
    /// The attempt failed fatally; the loop stops without further attempts.
    Block { reason: String },
}

/// One attempt and its verdict, kept for the published history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleAttempt {
    pub cycle: u32,
    pub verdict: CycleVerdict,
}

/// Terminal outcome of a bounded cycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Passed {
        cycles_used: u32,
    },
    Blocked {
        reason: String,
        history: Vec<CycleAttempt>,
    },
    /// The cycle budget ran out without a pass. Callers must transition the
    /// owning entity to a blocked/escalated state and publish the history.
    Exhausted {
        history: Vec<CycleAttempt>,
    },
}

impl CycleOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }

    pub fn history(&self) -> &[CycleAttempt] {
        match self {
            Self::Passed { .. } => &[],
            Self::Blocked { history, .. } | Self::Exhausted { history } => history,
        }
    }
}

/// Bounded loop driver.
#[derive(Debug, Clone, Copy)]
pub struct CycleController {
    max_cycles: u32,
}

impl CycleController {
    pub fn new(max_cycles: u32) -> Self {
        Self { max_cycles }
    }

    pub fn max_cycles(&self) -> u32 {
        self.max_cycles
    }

    /// Run the attempt function until it passes, blocks, or the budget is
    /// exhausted. Performs at most `max_cycles` attempts and returns
    /// immediately on a first-attempt pass.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> CycleOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CycleVerdict>,
    {
        let mut history = Vec::new();

        for cycle in 1..=self.max_cycles {
            let verdict = attempt(cycle).await;
            history.push(CycleAttempt {
                cycle,
                verdict: verdict.clone(),
            });

            match verdict {
                CycleVerdict::Pass => return CycleOutcome::Passed { cycles_used: cycle },
                CycleVerdict::Concern { .. } => continue,
                CycleVerdict::Block { reason } => {
                    return CycleOutcome::Blocked { reason, history };
                }
            }
        }

        CycleOutcome::Exhausted { history }
    }
}
