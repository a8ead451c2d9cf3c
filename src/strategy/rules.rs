use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::indicators::{IndicatorSpec, Indicators};
use super::producer::{ProducerError, SignalProducer};
use super::signals::{Direction, MarketContext, Signal};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "cross_over")]
    CrossOver,
    #[serde(rename = "cross_under")]
    CrossUnder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Operand {
    Value(f64),
    Feature(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub left: Operand,
    pub operator: Operator,
    pub right: Operand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionGroup {
    All { and: Vec<ConditionGroup> },
    Any { or: Vec<ConditionGroup> },
    Leaf(Condition),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
    #[serde(default)]
    pub entry: Option<ConditionGroup>,
    #[serde(default)]
    pub exit: Option<ConditionGroup>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.6
}

/// Latest and one-bar-back values of every named input.
struct FeatureFrame<'a> {
    context: &'a MarketContext,
    current: BTreeMap<String, f64>,
    previous: BTreeMap<String, f64>,
}

impl<'a> FeatureFrame<'a> {
    fn build(context: &'a MarketContext, indicators: &[IndicatorSpec]) -> Result<Self, ProducerError> {
        let mut current = context.features.clone();
        let mut previous = BTreeMap::new();
        let prices = context.prices.as_slice();

        for spec in indicators {
            let value = Indicators::new(prices).compute(spec).ok_or_else(|| {
                ProducerError::MalformedResponse(format!(
                    "not enough price history for indicator '{}' ({} closes)",
                    spec.id,
                    prices.len()
                ))
            })?;
            current.insert(spec.id.clone(), value);

            if prices.len() > 1 {
                if let Some(prev) = Indicators::new(&prices[..prices.len() - 1]).compute(spec) {
                    previous.insert(spec.id.clone(), prev);
                }
            }
        }

        Ok(Self {
            context,
            current,
            previous,
        })
    }

    fn current(&self, operand: &Operand) -> Result<f64, ProducerError> {
        match operand {
            Operand::Value(v) => Ok(*v),
            Operand::Feature(name) => self.current.get(name).copied().ok_or_else(|| {
                ProducerError::MalformedResponse(format!("unknown feature '{}'", name))
            }),
        }
    }

    fn previous(&self, operand: &Operand) -> Result<f64, ProducerError> {
        match operand {
            Operand::Value(v) => Ok(*v),
            Operand::Feature(name) => {
                if let Some(v) = self.previous.get(name) {
                    return Ok(*v);
                }
                if let Some(v) = self.context.features.get(&format!("{}_prev", name)) {
                    return Ok(*v);
                }
                self.current(operand)
            }
        }
    }

    fn check(&self, condition: &Condition) -> Result<bool, ProducerError> {
        let left = self.current(&condition.left)?;
        let right = self.current(&condition.right)?;

        let result = match condition.operator {
            Operator::Greater => left > right,
            Operator::Less => left < right,
            Operator::Equal => (left - right).abs() < f64::EPSILON,
            Operator::CrossOver => {
                let prev_left = self.previous(&condition.left)?;
                let prev_right = self.previous(&condition.right)?;
                prev_left <= prev_right && left > right
            }
            Operator::CrossUnder => {
                let prev_left = self.previous(&condition.left)?;
                let prev_right = self.previous(&condition.right)?;
                prev_left >= prev_right && left < right
            }
        };

        Ok(result)
    }

    fn check_group(&self, group: &ConditionGroup) -> Result<bool, ProducerError> {
        match group {
            ConditionGroup::All { and } => {
                if and.is_empty() {
                    return Ok(false);
                }
                for child in and {
                    if !self.check_group(child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionGroup::Any { or } => {
                for child in or {
                    if self.check_group(child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionGroup::Leaf(condition) => self.check(condition),
        }
    }
}

/// Detector driven by a declarative entry/exit rule set.
pub struct RuleProducer {
    name: String,
    rules: RuleSet,
}

impl RuleProducer {
    pub fn new(name: impl Into<String>, rules: RuleSet) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    pub fn evaluate(&self, context: &MarketContext) -> Result<Signal, ProducerError> {
        let frame = FeatureFrame::build(context, &self.rules.indicators)?;

        let entry = match &self.rules.entry {
            Some(group) => frame.check_group(group)?,
            None => false,
        };
        let exit = match &self.rules.exit {
            Some(group) => frame.check_group(group)?,
            None => false,
        };

        let (direction, rationale) = match (entry, exit) {
            (true, false) => (Direction::Buy, "entry conditions met"),
            (false, true) => (Direction::Sell, "exit conditions met"),
            (true, true) => (Direction::Hold, "entry and exit both triggered"),
            (false, false) => (Direction::Hold, "no rule triggered"),
        };

        tracing::trace!(
            "{} on {} {}: {} ({})",
            self.name,
            context.symbol,
            context.timeframe,
            direction,
            rationale
        );

        Ok(Signal::new(self.name.clone(), direction, self.rules.confidence).with_rationale(rationale))
    }
}

#[async_trait]
impl SignalProducer for RuleProducer {
    async fn produce(&self, context: &MarketContext) -> Result<Signal, ProducerError> {
        self.evaluate(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::indicators::IndicatorKind;

    fn ema_cross_rules() -> RuleSet {
        serde_json::from_value(serde_json::json!({
            "indicators": [
                { "id": "fast", "kind": "sma", "period": 2 },
                { "id": "slow", "kind": "sma", "period": 4 }
            ],
            "entry": { "left": "fast", "operator": "cross_over", "right": "slow" },
            "exit": { "left": "fast", "operator": "cross_under", "right": "slow" },
            "confidence": 0.8
        }))
        .unwrap()
    }

    #[test]
    fn test_rule_set_deserializes_nested_groups() {
        let rules: RuleSet = serde_json::from_value(serde_json::json!({
            "entry": { "and": [
                { "left": "rsi", "operator": "<", "right": 30.0 },
                { "or": [
                    { "left": "volume_ratio", "operator": ">", "right": 1.5 },
                    { "left": "imbalance", "operator": ">", "right": 0.3 }
                ]}
            ]}
        }))
        .unwrap();

        match rules.entry.unwrap() {
            ConditionGroup::All { and } => {
                assert_eq!(and.len(), 2);
                assert!(matches!(and[1], ConditionGroup::Any { .. }));
            }
            other => panic!("unexpected group: {:?}", other),
        }
        assert_eq!(rules.confidence, 0.6);
    }

    #[test]
    fn test_cross_over_votes_buy() {
        let producer = RuleProducer::new("sma_cross", ema_cross_rules());
        // fast sma crosses above slow sma on the last close
        let ctx = MarketContext::new("BTCUSDT", "1m").with_prices(vec![10.0, 10.0, 10.0, 9.0, 12.0]);

        let signal = producer.evaluate(&ctx).unwrap();
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.confidence, 0.8);
    }

    #[test]
    fn test_cross_under_votes_sell() {
        let producer = RuleProducer::new("sma_cross", ema_cross_rules());
        let ctx = MarketContext::new("BTCUSDT", "1m").with_prices(vec![10.0, 10.0, 10.0, 11.0, 8.0]);

        assert_eq!(producer.evaluate(&ctx).unwrap().direction, Direction::Sell);
    }

    #[test]
    fn test_no_trigger_holds() {
        let producer = RuleProducer::new("sma_cross", ema_cross_rules());
        let ctx = MarketContext::new("BTCUSDT", "1m").with_prices(vec![10.0; 6]);

        let signal = producer.evaluate(&ctx).unwrap();
        assert_eq!(signal.direction, Direction::Hold);
        assert_eq!(signal.rationale, "no rule triggered");
    }

    #[test]
    fn test_short_history_is_malformed() {
        let producer = RuleProducer::new("sma_cross", ema_cross_rules());
        let ctx = MarketContext::new("BTCUSDT", "1m").with_prices(vec![10.0, 11.0]);

        let err = producer.evaluate(&ctx).unwrap_err();
        assert!(matches!(err, ProducerError::MalformedResponse(_)));
    }

    #[test]
    fn test_raw_feature_cross_uses_prev_suffix() {
        let rules = RuleSet {
            indicators: vec![],
            entry: Some(ConditionGroup::Leaf(Condition {
                left: Operand::Feature("macd".into()),
                operator: Operator::CrossOver,
                right: Operand::Value(0.0),
            })),
            exit: None,
            confidence: 0.7,
        };
        let producer = RuleProducer::new("macd_zero", rules);
        let ctx = MarketContext::new("ETHUSDT", "5m")
            .with_feature("macd", 0.4)
            .with_feature("macd_prev", -0.1);

        assert_eq!(producer.evaluate(&ctx).unwrap().direction, Direction::Buy);
    }

    #[test]
    fn test_unknown_feature_is_malformed() {
        let rules = RuleSet {
            indicators: vec![IndicatorSpec {
                id: "rsi".into(),
                kind: IndicatorKind::Rsi,
                period: 2,
            }],
            entry: Some(ConditionGroup::Leaf(Condition {
                left: Operand::Feature("missing".into()),
                operator: Operator::Greater,
                right: Operand::Value(1.0),
            })),
            exit: None,
            confidence: 0.7,
        };
        let ctx = MarketContext::new("ETHUSDT", "5m").with_prices(vec![1.0, 2.0, 3.0]);

        let err = RuleProducer::new("bad", rules).evaluate(&ctx).unwrap_err();
        assert_eq!(err.message(), "unknown feature 'missing'");
    }
}
