use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregation::{BucketScores, Verdict};
use super::policy::ActionTier;
use crate::registry::Tier;
use crate::strategy::{Direction, FailureKind, Signal};

pub const INSUFFICIENT_VOTES: &str = "insufficient_votes";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Decided,
    Degraded,
}

/// Producer call that was excluded from the vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerFailure {
    pub producer_id: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub evaluation_id: Uuid,
    pub symbol: String,
    pub timeframe: String,
    pub tier: Tier,
    pub outcome: Outcome,
    pub decision: Direction,
    pub confidence: f64,
    pub agreement_ratio: f64,
    pub action_tier: ActionTier,
    pub reason: Option<String>,
    pub scores: BucketScores,
    /// Sorted by producer id.
    pub signals: Vec<Signal>,
    pub failures: Vec<ProducerFailure>,
    /// Producers cut off by early exit, plus those that never got a call slot.
    pub cancelled: Vec<String>,
    pub total_cost: f64,
    pub cache_hit: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub(crate) fn decided(
        symbol: &str,
        timeframe: &str,
        tier: Tier,
        verdict: Verdict,
        signals: Vec<Signal>,
    ) -> Self {
        Self {
            evaluation_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            tier,
            outcome: Outcome::Decided,
            decision: verdict.decision,
            confidence: verdict.confidence,
            agreement_ratio: verdict.agreement_ratio,
            action_tier: verdict.action_tier,
            reason: None,
            scores: verdict.scores,
            total_cost: signals.iter().map(|s| s.cost).sum(),
            signals,
            failures: Vec::new(),
            cancelled: Vec::new(),
            cache_hit: false,
            evaluated_at: Utc::now(),
        }
    }

    /// Zero-confidence HOLD issued when quorum is not met.
    pub(crate) fn degraded(
        symbol: &str,
        timeframe: &str,
        tier: Tier,
        scores: BucketScores,
        signals: Vec<Signal>,
    ) -> Self {
        Self {
            evaluation_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            tier,
            outcome: Outcome::Degraded,
            decision: Direction::Hold,
            confidence: 0.0,
            agreement_ratio: 0.0,
            action_tier: ActionTier::HoldConflicting,
            reason: Some(INSUFFICIENT_VOTES.to_string()),
            scores,
            total_cost: signals.iter().map(|s| s.cost).sum(),
            signals,
            failures: Vec::new(),
            cancelled: Vec::new(),
            cache_hit: false,
            evaluated_at: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome == Outcome::Degraded
    }

    pub fn as_cache_hit(&self) -> Self {
        let mut hit = self.clone();
        hit.cache_hit = true;
        hit
    }
}
