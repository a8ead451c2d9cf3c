use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Spend ceiling per window, in the producers' cost unit.
    pub ceiling: f64,
    pub window_secs: u64,
    /// Fraction of the ceiling that raises the warning state.
    pub warning_ratio: f64,
    /// Headroom below which selection drops to the quick tier.
    pub floor: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ceiling: 10.0,
            window_secs: 86_400,
            warning_ratio: 0.80,
            floor: 2.0,
        }
    }
}

impl BudgetConfig {
    pub fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.window_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Exhausted,
}

impl fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetLevel::Normal => write!(f, "normal"),
            BudgetLevel::Warning => write!(f, "warning"),
            BudgetLevel::Exhausted => write!(f, "exhausted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernorSnapshot {
    pub window_start: DateTime<Utc>,
    pub total_spend: f64,
    pub per_producer: BTreeMap<String, f64>,
}

#[derive(Debug)]
struct Ledger {
    window_start: DateTime<Utc>,
    total: f64,
    per_producer: BTreeMap<String, f64>,
    level: BudgetLevel,
}

impl Ledger {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            total: 0.0,
            per_producer: BTreeMap::new(),
            level: BudgetLevel::Normal,
        }
    }

    fn roll_if_expired(&mut self, now: DateTime<Utc>, config: &BudgetConfig) {
        if now - self.window_start >= config.window() {
            tracing::info!(
                "🔄 Budget window rolled over (spent {:.4} of {:.4})",
                self.total,
                config.ceiling
            );
            *self = Ledger::fresh(now);
        }
    }

    fn classify(&self, config: &BudgetConfig) -> BudgetLevel {
        if config.ceiling <= 0.0 || self.total >= config.ceiling {
            BudgetLevel::Exhausted
        } else if self.total >= config.ceiling * config.warning_ratio {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Normal
        }
    }

    fn update_level(&mut self, config: &BudgetConfig) -> BudgetLevel {
        let level = self.classify(config);
        if level != self.level {
            match level {
                BudgetLevel::Exhausted => tracing::error!(
                    "🛑 Budget exhausted: {:.4}/{:.4}, forcing quick tier until the window resets",
                    self.total,
                    config.ceiling
                ),
                BudgetLevel::Warning => tracing::warn!(
                    "⚠️  Budget at {:.1}% of ceiling ({:.4}/{:.4})",
                    self.total / config.ceiling * 100.0,
                    self.total,
                    config.ceiling
                ),
                BudgetLevel::Normal => tracing::info!("🟢 Budget back to normal"),
            }
            self.level = level;
        }
        level
    }
}

/// Rolling-window spend tracker. All mutation goes through one lock, so
/// concurrent evaluations can never lose an update.
pub struct CostGovernor {
    config: RwLock<BudgetConfig>,
    ledger: RwLock<Ledger>,
}

impl CostGovernor {
    pub fn new(config: BudgetConfig) -> Self {
        tracing::info!(
            "💰 Cost governor initialized (ceiling {:.4} per {}s, warning at {:.0}%)",
            config.ceiling,
            config.window_secs,
            config.warning_ratio * 100.0
        );

        Self {
            config: RwLock::new(config),
            ledger: RwLock::new(Ledger::fresh(Utc::now())),
        }
    }

    pub async fn log_cost(&self, producer_id: &str, cost: f64) -> BudgetLevel {
        self.log_cost_at(producer_id, cost, Utc::now()).await
    }

    pub(crate) async fn log_cost_at(
        &self,
        producer_id: &str,
        cost: f64,
        now: DateTime<Utc>,
    ) -> BudgetLevel {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;
        ledger.roll_if_expired(now, &config);

        if !cost.is_finite() || cost < 0.0 {
            tracing::warn!("Ignoring invalid cost {} reported for {}", cost, producer_id);
            return ledger.level;
        }

        ledger.total += cost;
        *ledger.per_producer.entry(producer_id.to_string()).or_insert(0.0) += cost;
        ledger.update_level(&config)
    }

    pub async fn remaining_budget(&self) -> f64 {
        self.remaining_budget_at(Utc::now()).await
    }

    pub(crate) async fn remaining_budget_at(&self, now: DateTime<Utc>) -> f64 {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;
        ledger.roll_if_expired(now, &config);
        ledger.update_level(&config);
        (config.ceiling - ledger.total).max(0.0)
    }

    pub async fn level(&self) -> BudgetLevel {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;
        ledger.roll_if_expired(Utc::now(), &config);
        ledger.update_level(&config)
    }

    pub async fn is_exhausted(&self) -> bool {
        self.level().await == BudgetLevel::Exhausted
    }

    /// Spend in the current window; an expired window reads as zero.
    pub async fn total_spend(&self) -> f64 {
        self.total_spend_at(Utc::now()).await
    }

    pub(crate) async fn total_spend_at(&self, now: DateTime<Utc>) -> f64 {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;
        ledger.roll_if_expired(now, &config);
        ledger.update_level(&config);
        ledger.total
    }

    pub async fn producer_spend(&self, producer_id: &str) -> f64 {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;
        ledger.roll_if_expired(Utc::now(), &config);
        ledger.per_producer.get(producer_id).copied().unwrap_or(0.0)
    }

    pub async fn config(&self) -> BudgetConfig {
        self.config.read().await.clone()
    }

    /// Hot reload; spend in the current window is kept.
    pub async fn set_config(&self, config: BudgetConfig) {
        let mut ledger = self.ledger.write().await;
        ledger.update_level(&config);
        *self.config.write().await = config;
    }

    pub async fn reset_window(&self) {
        *self.ledger.write().await = Ledger::fresh(Utc::now());
    }

    pub async fn snapshot(&self) -> GovernorSnapshot {
        let ledger = self.ledger.read().await;
        GovernorSnapshot {
            window_start: ledger.window_start,
            total_spend: ledger.total,
            per_producer: ledger.per_producer.clone(),
        }
    }

    /// A snapshot from an already expired window starts a fresh one.
    pub async fn restore(&self, snapshot: GovernorSnapshot) {
        self.restore_at(snapshot, Utc::now()).await
    }

    pub(crate) async fn restore_at(&self, snapshot: GovernorSnapshot, now: DateTime<Utc>) {
        let config = self.config.read().await.clone();
        let mut ledger = self.ledger.write().await;

        *ledger = Ledger {
            window_start: snapshot.window_start,
            total: snapshot.total_spend,
            per_producer: snapshot.per_producer,
            level: BudgetLevel::Normal,
        };
        ledger.roll_if_expired(now, &config);
        ledger.update_level(&config);

        tracing::info!(
            "♻️  Restored budget ledger: {:.4} spent since {}",
            ledger.total,
            ledger.window_start
        );
    }
}
