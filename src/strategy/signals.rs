use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Hold, Direction::Buy, Direction::Sell];

    /// Slot of this direction in per-bucket arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Hold => 0,
            Direction::Buy => 1,
            Direction::Sell => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Buy),
            "SELL" | "SHORT" => Ok(Direction::Sell),
            "HOLD" | "NEUTRAL" => Ok(Direction::Hold),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Everything a producer gets to look at for one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketContext {
    pub symbol: String,
    pub timeframe: String,
    /// Recent closes, oldest first.
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl MarketContext {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            prices: Vec::new(),
            features: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn with_prices(mut self, prices: Vec<f64>) -> Self {
        self.prices = prices;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub producer_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub rationale: String,
    pub cost: f64,
    pub latency_ms: u64,
}

impl Signal {
    pub fn new(producer_id: impl Into<String>, direction: Direction, confidence: f64) -> Self {
        Self {
            producer_id: producer_id.into(),
            direction,
            confidence: clamp_confidence(confidence),
            rationale: String::new(),
            cost: 0.0,
            latency_ms: 0,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// NaN collapses to zero.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
