use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::strategy::Direction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionTier {
    ExecuteFull,
    ExecuteReduced,
    Wait,
    HoldConflicting,
}

impl ActionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTier::ExecuteFull => "execute_full",
            ActionTier::ExecuteReduced => "execute_reduced",
            ActionTier::Wait => "wait",
            ActionTier::HoldConflicting => "hold_conflicting",
        }
    }
}

impl fmt::Display for ActionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub min_agreement: f64,
    pub min_confidence: f64,
}

impl Threshold {
    pub const fn new(min_agreement: f64, min_confidence: f64) -> Self {
        Self {
            min_agreement,
            min_confidence,
        }
    }

    fn admits(&self, agreement_ratio: f64, confidence: f64) -> bool {
        agreement_ratio >= self.min_agreement && confidence >= self.min_confidence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionThresholds {
    pub execute_full: Threshold,
    pub execute_reduced: Threshold,
    pub wait: Threshold,
}

impl Default for ActionThresholds {
    fn default() -> Self {
        Self {
            execute_full: Threshold::new(0.75, 0.70),
            execute_reduced: Threshold::new(0.60, 0.55),
            wait: Threshold::new(0.50, 0.40),
        }
    }
}

impl ActionThresholds {
    /// First matching rule wins, from most to least aggressive.
    pub fn classify(&self, agreement_ratio: f64, confidence: f64) -> ActionTier {
        if self.execute_full.admits(agreement_ratio, confidence) {
            ActionTier::ExecuteFull
        } else if self.execute_reduced.admits(agreement_ratio, confidence) {
            ActionTier::ExecuteReduced
        } else if self.wait.admits(agreement_ratio, confidence) {
            ActionTier::Wait
        } else {
            ActionTier::HoldConflicting
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Threshold)> {
        [
            ("execute_full", &self.execute_full),
            ("execute_reduced", &self.execute_reduced),
            ("wait", &self.wait),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    pub min_votes: usize,
    pub per_call_timeout_ms: u64,
    /// Cap on producer calls outstanding across every in-flight evaluation.
    pub max_outstanding_calls: usize,
    pub tie_break_order: Vec<Direction>,
    pub action_tiers: ActionThresholds,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_votes: 3,
            per_call_timeout_ms: 2_000,
            max_outstanding_calls: 32,
            tie_break_order: vec![Direction::Hold, Direction::Buy, Direction::Sell],
            action_tiers: ActionThresholds::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    /// Tie-break order as a fixed array; falls back to HOLD, BUY, SELL when the
    /// configured list is not a permutation of the three directions.
    pub fn tie_break(&self) -> [Direction; 3] {
        if is_direction_permutation(&self.tie_break_order) {
            [
                self.tie_break_order[0],
                self.tie_break_order[1],
                self.tie_break_order[2],
            ]
        } else {
            Direction::ALL
        }
    }
}

pub fn is_direction_permutation(order: &[Direction]) -> bool {
    order.len() == 3 && Direction::ALL.iter().all(|d| order.contains(d))
}
