//! Multi-producer signal consensus engine.
//!
//! Independent producers (rule detectors, remote advisory models) are queried
//! concurrently about a market context; their weighted votes are folded into a
//! single reproducible decision under a cost budget, with circuit breaking and
//! a single-flight response cache in front.

pub mod api;
pub mod budget;
pub mod cache;
pub mod consensus;
pub mod core;
pub mod monitoring;
pub mod registry;
pub mod service;
pub mod strategy;

pub use api::{EvaluationRequest, EvaluationResponse};
pub use consensus::{ConsensusEngine, ConsensusResult};
pub use service::{ConsensusService, ServiceError};
