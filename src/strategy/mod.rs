pub mod indicators;
pub mod producer;
pub mod rules;
pub mod signals;

pub use indicators::{IndicatorKind, IndicatorSpec, Indicators};
pub use producer::{FailureKind, ProducerError, SignalProducer};
pub use rules::{Condition, ConditionGroup, Operand, Operator, RuleProducer, RuleSet};
pub use signals::{clamp_confidence, Direction, MarketContext, Signal};
