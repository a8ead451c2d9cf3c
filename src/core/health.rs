use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::budget::{BudgetLevel, CostGovernor};
use crate::registry::{AnalyzerRegistry, CircuitState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub budget: bool,
    pub state_store: bool,
    /// One flag per producer: true while its circuit is closed.
    pub producers: BTreeMap<String, bool>,
}

impl ComponentHealth {
    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "budget" => Some(self.budget),
            "state_store" => Some(self.state_store),
            _ => self.producers.get(key).copied(),
        }
    }

    pub fn all_healthy(&self) -> bool {
        self.budget && self.state_store && self.producers.values().all(|ok| *ok)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    status: Arc<RwLock<ComponentHealth>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            status: Arc::new(RwLock::new(ComponentHealth {
                budget: true,
                state_store: true,
                producers: BTreeMap::new(),
            })),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();

        HealthStatus {
            status: if components.all_healthy() {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut status = self.status.write().await;
        match component {
            "budget" => status.budget = healthy,
            "state_store" => status.state_store = healthy,
            _ => {
                status.producers.insert(component.to_string(), healthy);
            }
        }
    }

    /// Re-reads circuit and budget state from the live components.
    pub async fn refresh(&self, registry: &AnalyzerRegistry, governor: &CostGovernor) {
        let producers: BTreeMap<String, bool> = registry
            .circuit_states()
            .await
            .into_iter()
            .map(|(id, state)| (id, state == CircuitState::Closed))
            .collect();
        let budget = governor.level().await != BudgetLevel::Exhausted;

        let mut status = self.status.write().await;
        status.producers = producers;
        status.budget = budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::registry::{AnalyzerSpec, BreakerConfig, Tier};
    use crate::strategy::producer::MockSignalProducer;

    #[tokio::test]
    async fn test_open_circuit_degrades_health() {
        let registry = AnalyzerRegistry::new(BreakerConfig::default(), 2.0);
        registry
            .register(
                AnalyzerSpec::new("waves", 1.0, 0.1, Tier::Standard),
                Arc::new(MockSignalProducer::new()),
            )
            .await
            .unwrap();
        let governor = CostGovernor::new(BudgetConfig::default());
        let health = HealthChecker::new();

        health.refresh(&registry, &governor).await;
        assert_eq!(health.get_status().await.status, "healthy");

        for _ in 0..3 {
            registry.record_failure("waves").await;
        }
        health.refresh(&registry, &governor).await;
        let status = health.get_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.components.get("waves"), Some(false));
    }

    #[tokio::test]
    async fn test_exhausted_budget_and_store_flags() {
        let registry = AnalyzerRegistry::new(BreakerConfig::default(), 2.0);
        let governor = CostGovernor::new(BudgetConfig::default());
        governor.log_cost("advisor", 10.0).await;
        let health = HealthChecker::new();

        health.refresh(&registry, &governor).await;
        assert_eq!(health.get_status().await.components.get("budget"), Some(false));

        governor.reset_window().await;
        health.refresh(&registry, &governor).await;
        health.update_component("state_store", false).await;
        let status = health.get_status().await;
        assert_eq!(status.status, "degraded");
        assert!(status.components.budget);
    }
}
