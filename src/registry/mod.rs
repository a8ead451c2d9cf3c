pub mod breaker;
pub mod spec;

pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, CircuitState};
pub use spec::{AnalyzerSpec, Tier};

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::strategy::SignalProducer;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("producer '{0}' must have a strictly positive weight, got {1}")]
    InvalidWeight(String, f64),
    #[error("producer '{0}' must have a non-negative cost, got {1}")]
    InvalidCost(String, f64),
    #[error("unknown producer '{0}'")]
    UnknownProducer(String),
}

struct RegisteredProducer {
    spec: AnalyzerSpec,
    producer: Arc<dyn SignalProducer>,
}

/// A producer checked out for one call of one evaluation.
#[derive(Clone)]
pub struct Invocation {
    pub id: String,
    pub weight: f64,
    pub cost_per_call: f64,
    pub trial: bool,
    pub producer: Arc<dyn SignalProducer>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("cost_per_call", &self.cost_per_call)
            .field("trial", &self.trial)
            .finish()
    }
}

pub struct AnalyzerRegistry {
    entries: RwLock<BTreeMap<String, RegisteredProducer>>,
    breaker: RwLock<BreakerConfig>,
    budget_floor: RwLock<f64>,
}

impl AnalyzerRegistry {
    pub fn new(breaker: BreakerConfig, budget_floor: f64) -> Self {
        tracing::info!(
            "🗂️  Analyzer registry initialized (trip after {} failures, cool-down {}ms, budget floor {:.2})",
            breaker.failure_threshold,
            breaker.cooldown_ms,
            budget_floor
        );

        Self {
            entries: RwLock::new(BTreeMap::new()),
            breaker: RwLock::new(breaker),
            budget_floor: RwLock::new(budget_floor),
        }
    }

    /// Adds or replaces a producer. Replacing keeps the old circuit state.
    pub async fn register(
        &self,
        spec: AnalyzerSpec,
        producer: Arc<dyn SignalProducer>,
    ) -> Result<(), RegistryError> {
        validate_spec(&spec.id, spec.weight, spec.cost_per_call)?;

        let mut entries = self.entries.write().await;
        let spec = match entries.remove(&spec.id) {
            Some(existing) => AnalyzerSpec {
                weight: spec.weight,
                cost_per_call: spec.cost_per_call,
                tier: spec.tier,
                ..existing.spec
            },
            None => spec,
        };

        tracing::info!(
            "➕ Registered producer {} (tier: {}, weight: {:.2}, cost: {:.4})",
            spec.id,
            spec.tier,
            spec.weight,
            spec.cost_per_call
        );
        entries.insert(spec.id.clone(), RegisteredProducer { spec, producer });
        Ok(())
    }

    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.entries.write().await.remove(id).is_some();
        if removed {
            tracing::info!("➖ Deregistered producer {}", id);
        }
        removed
    }

    /// Hot update of static metadata; circuit state is untouched.
    pub async fn update_spec(
        &self,
        id: &str,
        weight: f64,
        cost_per_call: f64,
        tier: Tier,
    ) -> Result<(), RegistryError> {
        validate_spec(id, weight, cost_per_call)?;

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownProducer(id.to_string()))?;
        entry.spec.weight = weight;
        entry.spec.cost_per_call = cost_per_call;
        entry.spec.tier = tier;
        Ok(())
    }

    pub async fn set_breaker_config(&self, config: BreakerConfig) {
        *self.breaker.write().await = config;
    }

    pub async fn set_budget_floor(&self, floor: f64) {
        *self.budget_floor.write().await = floor;
    }

    /// At or below the budget floor every request is served from the quick tier.
    pub async fn effective_tier(&self, requested: Tier, budget_remaining: f64) -> Tier {
        let floor = *self.budget_floor.read().await;
        if budget_remaining <= floor && requested != Tier::Quick {
            tracing::debug!(
                "💸 Budget headroom {:.4} at or below floor {:.4}, downgrading {} -> quick",
                budget_remaining,
                floor,
                requested
            );
            Tier::Quick
        } else {
            requested
        }
    }

    /// Producer ids eligible for `tier`, most expensive tier first, then by
    /// descending weight, then by id.
    pub async fn select(&self, tier: Tier, budget_remaining: f64) -> Vec<String> {
        let tier = self.effective_tier(tier, budget_remaining).await;
        let now = Instant::now();
        let entries = self.entries.read().await;

        let mut eligible: Vec<&AnalyzerSpec> = entries
            .values()
            .map(|e| &e.spec)
            .filter(|s| tier.includes(s.tier) && s.is_available(now))
            .collect();

        eligible.sort_by(|a, b| {
            b.tier
                .cmp(&a.tier)
                .then_with(|| b.weight.total_cmp(&a.weight))
                .then_with(|| a.id.cmp(&b.id))
        });

        eligible.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Admits the given producers through their circuit breakers. Producers whose
    /// circuit rejects the call (or whose trial slot is already taken) are skipped.
    pub async fn checkout(&self, ids: &[String]) -> Vec<Invocation> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut invocations = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(entry) = entries.get_mut(id) else {
                continue;
            };
            let trial = match entry.spec.admit(now) {
                Admission::Admitted => false,
                Admission::Trial => {
                    tracing::info!("🟡 Half-open trial call for {}", id);
                    true
                }
                Admission::Rejected => continue,
            };
            invocations.push(Invocation {
                id: id.clone(),
                weight: entry.spec.weight,
                cost_per_call: entry.spec.cost_per_call,
                trial,
                producer: entry.producer.clone(),
            });
        }

        invocations
    }

    pub async fn record_success(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            let was_half_open = entry.spec.is_half_open();
            entry.spec.on_success();
            if was_half_open && !entry.spec.is_half_open() {
                tracing::info!("🟢 Circuit closed for {} after successful trial", id);
            }
        }
    }

    /// Returns true when this failure opened the producer's circuit.
    pub async fn record_failure(&self, id: &str) -> bool {
        let config = self.breaker.read().await.clone();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };

        let tripped = entry.spec.on_failure(Instant::now(), &config);
        if tripped {
            tracing::warn!(
                "🔴 Circuit opened for {} after {} consecutive failures, cooling down {}ms",
                id,
                entry.spec.consecutive_failures,
                config.cooldown_ms
            );
        }
        tripped
    }

    pub async fn record_cancelled(&self, id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.spec.on_cancelled();
        }
    }

    pub async fn spec(&self, id: &str) -> Option<AnalyzerSpec> {
        let mut spec = self.entries.read().await.get(id)?.spec.clone();
        spec.refresh(Instant::now());
        Some(spec)
    }

    pub async fn specs(&self) -> Vec<AnalyzerSpec> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .map(|e| {
                let mut spec = e.spec.clone();
                spec.refresh(now);
                spec
            })
            .collect()
    }

    pub async fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .map(|e| (e.spec.id.clone(), CircuitState::of(&e.spec, now)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .map(|e| BreakerSnapshot::capture(&e.spec, now))
            .collect()
    }

    /// Unknown producer ids in the snapshot are ignored.
    pub async fn restore(&self, snapshots: &[BreakerSnapshot]) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut restored = 0;
        for snapshot in snapshots {
            if let Some(entry) = entries.get_mut(&snapshot.producer_id) {
                snapshot.apply(&mut entry.spec, now);
                restored += 1;
            }
        }
        tracing::info!("♻️  Restored circuit state for {} producers", restored);
    }
}

fn validate_spec(id: &str, weight: f64, cost_per_call: f64) -> Result<(), RegistryError> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(RegistryError::InvalidWeight(id.to_string(), weight));
    }
    if !cost_per_call.is_finite() || cost_per_call < 0.0 {
        return Err(RegistryError::InvalidCost(id.to_string(), cost_per_call));
    }
    Ok(())
}
