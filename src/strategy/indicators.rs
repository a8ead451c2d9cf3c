use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Ema,
    Sma,
    Rsi,
}

/// Named indicator computed from the context's closes, e.g. `{ id = "fast_ema", kind = "ema", period = 9 }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorSpec {
    pub id: String,
    pub kind: IndicatorKind,
    #[serde(default = "default_period")]
    pub period: usize,
}

fn default_period() -> usize {
    14
}

pub struct Indicators<'a> {
    prices: &'a [f64],
}

impl<'a> Indicators<'a> {
    pub fn new(prices: &'a [f64]) -> Self {
        Self { prices }
    }

    pub fn compute(&self, spec: &IndicatorSpec) -> Option<f64> {
        match spec.kind {
            IndicatorKind::Ema => self.ema(spec.period),
            IndicatorKind::Sma => self.sma(spec.period),
            IndicatorKind::Rsi => self.rsi(spec.period),
        }
    }

    pub fn sma(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period {
            return None;
        }

        let sum: f64 = self.prices.iter().rev().take(period).sum();
        Some(sum / period as f64)
    }

    pub fn ema(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period {
            return None;
        }

        let multiplier = 2.0 / (period as f64 + 1.0);
        let mut ema = self.prices[0];

        for price in self.prices.iter().skip(1) {
            ema = (price - ema) * multiplier + ema;
        }

        Some(ema)
    }

    pub fn rsi(&self, period: usize) -> Option<f64> {
        if period == 0 || self.prices.len() < period + 1 {
            return None;
        }

        let mut gains = 0.0;
        let mut losses = 0.0;

        for i in (self.prices.len() - period)..self.prices.len() {
            let change = self.prices[i] - self.prices[i - 1];
            if change > 0.0 {
                gains += change;
            } else {
                losses += -change;
            }
        }

        let avg_gain = gains / period as f64;
        let avg_loss = losses / period as f64;

        if avg_loss == 0.0 {
            return Some(100.0);
        }

        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }
}
