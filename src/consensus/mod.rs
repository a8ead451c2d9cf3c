pub mod aggregation;
pub mod engine;
pub mod policy;
pub mod result;

pub use aggregation::{decide, BucketScores, Tally, Verdict, Vote};
pub use engine::{ConsensusEngine, ConsensusError, EvaluationPlan, Phase};
pub use policy::{ActionThresholds, ActionTier, ConsensusConfig, Threshold};
pub use result::{ConsensusResult, Outcome, ProducerFailure, INSUFFICIENT_VOTES};
