use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::consensus::{ActionTier, ConsensusResult, Outcome};
use crate::registry::Tier;
use crate::strategy::{Direction, MarketContext, Signal};

/// Body POSTed to a remote advisory model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryRequest<'a> {
    pub market_context: &'a MarketContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryResponse {
    pub direction: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub symbol: String,
    pub timeframe: String,
    #[serde(default)]
    pub context_features: BTreeMap<String, f64>,
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub importance_tier: Option<Tier>,
    #[serde(default)]
    pub budget_override: Option<f64>,
}

impl EvaluationRequest {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            context_features: BTreeMap::new(),
            prices: Vec::new(),
            importance_tier: None,
            budget_override: None,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.context_features.insert(name.into(), value);
        self
    }

    pub fn with_prices(mut self, prices: Vec<f64>) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.importance_tier = Some(tier);
        self
    }

    pub fn with_budget_override(mut self, budget: f64) -> Self {
        self.budget_override = Some(budget);
        self
    }

    pub fn to_context(&self) -> MarketContext {
        MarketContext {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            prices: self.prices.clone(),
            features: self.context_features.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResponse {
    pub evaluation_id: Uuid,
    pub decision: Direction,
    pub confidence: f64,
    pub agreement_ratio: f64,
    pub action_tier: ActionTier,
    pub tier: Tier,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub contributing_signals: Vec<Signal>,
    pub cache_hit: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl From<ConsensusResult> for EvaluationResponse {
    fn from(result: ConsensusResult) -> Self {
        Self {
            evaluation_id: result.evaluation_id,
            decision: result.decision,
            confidence: result.confidence,
            agreement_ratio: result.agreement_ratio,
            action_tier: result.action_tier,
            tier: result.tier,
            outcome: result.outcome,
            reason: result.reason,
            contributing_signals: result.signals,
            cache_hit: result.cache_hit,
            evaluated_at: result.evaluated_at,
        }
    }
}
