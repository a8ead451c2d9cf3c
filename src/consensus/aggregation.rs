//! Weighted voting over completed signals.
//!
//! Everything here is pure and order-independent: votes are sorted by producer
//! id before any floating point accumulation, so the same vote set always yields
//! bit-identical scores whatever order the producers answered in.

use serde::{Deserialize, Serialize};

use super::policy::{ActionThresholds, ActionTier};
use crate::strategy::Direction;

/// Scores closer than this are treated as tied.
pub const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub producer_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BucketScores {
    pub hold: f64,
    pub buy: f64,
    pub sell: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    scores: [f64; 3],
    counts: [usize; 3],
    total_weight: f64,
    valid: usize,
}

impl Tally {
    pub fn from_votes(votes: &[Vote]) -> Self {
        let mut ordered: Vec<&Vote> = votes.iter().collect();
        ordered.sort_by(|a, b| {
            a.producer_id
                .cmp(&b.producer_id)
                .then_with(|| a.direction.cmp(&b.direction))
                .then_with(|| a.confidence.total_cmp(&b.confidence))
                .then_with(|| a.weight.total_cmp(&b.weight))
        });

        let mut tally = Tally::default();
        for vote in ordered {
            let slot = vote.direction.index();
            tally.scores[slot] += vote.weight * vote.confidence;
            tally.counts[slot] += 1;
            tally.total_weight += vote.weight;
            tally.valid += 1;
        }
        tally
    }

    pub fn score(&self, direction: Direction) -> f64 {
        self.scores[direction.index()]
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.counts[direction.index()]
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn valid(&self) -> usize {
        self.valid
    }

    pub fn buckets(&self) -> BucketScores {
        BucketScores {
            hold: self.score(Direction::Hold),
            buy: self.score(Direction::Buy),
            sell: self.score(Direction::Sell),
        }
    }

    /// Bucket with the largest score; ties go to the earliest entry of `tie_break`.
    pub fn leader(&self, tie_break: &[Direction; 3]) -> Direction {
        let max = self.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        tie_break
            .iter()
            .copied()
            .find(|d| self.score(*d) >= max - SCORE_EPSILON)
            .unwrap_or(Direction::Hold)
    }

    /// True when no distribution of `outstanding_weight` (each outstanding vote
    /// contributes at most its weight, at confidence 1.0) can change the leader.
    pub fn is_settled(&self, outstanding_weight: f64, tie_break: &[Direction; 3]) -> bool {
        if self.valid == 0 {
            return false;
        }
        if outstanding_weight <= 0.0 {
            return true;
        }

        let leader = self.leader(tie_break);
        let leader_rank = rank(leader, tie_break);
        let leader_score = self.score(leader);

        Direction::ALL
            .iter()
            .copied()
            .filter(|d| *d != leader)
            .all(|challenger| {
                let gap = leader_score - self.score(challenger);
                if leader_rank < rank(challenger, tie_break) {
                    // leader keeps a tie
                    gap >= outstanding_weight - SCORE_EPSILON
                } else {
                    gap > outstanding_weight + SCORE_EPSILON
                }
            })
    }
}

fn rank(direction: Direction, tie_break: &[Direction; 3]) -> usize {
    tie_break
        .iter()
        .position(|d| *d == direction)
        .unwrap_or(tie_break.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Direction,
    pub confidence: f64,
    pub agreement_ratio: f64,
    pub action_tier: ActionTier,
    pub scores: BucketScores,
}

/// Decide over a quorate vote set. Callers check quorum first.
pub fn decide(votes: &[Vote], tie_break: &[Direction; 3], thresholds: &ActionThresholds) -> Verdict {
    let tally = Tally::from_votes(votes);
    decide_tally(&tally, tie_break, thresholds)
}

pub fn decide_tally(tally: &Tally, tie_break: &[Direction; 3], thresholds: &ActionThresholds) -> Verdict {
    let decision = tally.leader(tie_break);

    let confidence = if tally.total_weight() > 0.0 {
        (tally.score(decision) / tally.total_weight()).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let agreement_ratio = if tally.valid() > 0 {
        tally.count(decision) as f64 / tally.valid() as f64
    } else {
        0.0
    };

    Verdict {
        decision,
        confidence,
        agreement_ratio,
        action_tier: thresholds.classify(agreement_ratio, confidence),
        scores: tally.buckets(),
    }
}
