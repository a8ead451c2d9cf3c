use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::spec::AnalyzerSpec;

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// First call after a cool-down; its outcome decides whether the circuit closes.
    Trial,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn of(spec: &AnalyzerSpec, now: Instant) -> Self {
        let mut probe = spec.clone();
        probe.refresh(now);
        if !probe.enabled {
            CircuitState::Open
        } else if probe.is_half_open() {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }
}

/// Restart-safe view of one producer's circuit. Instants don't survive a
/// process restart, so the cool-down is stored as time remaining.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub producer_id: String,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open: bool,
}

impl BreakerSnapshot {
    pub fn capture(spec: &AnalyzerSpec, now: Instant) -> Self {
        let cooldown_remaining_ms = match spec.cooldown_until {
            Some(until) if !spec.enabled => {
                Some(until.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };

        Self {
            producer_id: spec.id.clone(),
            consecutive_failures: spec.consecutive_failures,
            cooldown_remaining_ms,
            half_open: spec.is_half_open(),
        }
    }

    pub fn apply(&self, spec: &mut AnalyzerSpec, now: Instant) {
        spec.consecutive_failures = self.consecutive_failures;
        spec.trial_in_flight = false;
        match self.cooldown_remaining_ms {
            Some(remaining) => {
                spec.enabled = false;
                spec.half_open = false;
                spec.cooldown_until = Some(now + Duration::from_millis(remaining));
            }
            None => {
                spec.enabled = true;
                spec.half_open = self.half_open;
                spec.cooldown_until = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tier;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 1_000,
        }
    }

    fn spec() -> AnalyzerSpec {
        AnalyzerSpec::new("waves", 1.0, 0.1, Tier::Standard)
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let now = Instant::now();
        let mut spec = spec();

        assert!(!spec.on_failure(now, &config()));
        assert!(!spec.on_failure(now, &config()));
        assert!(spec.on_failure(now, &config()));

        assert!(!spec.enabled);
        assert_eq!(spec.admit(now), Admission::Rejected);
        assert_eq!(CircuitState::of(&spec, now), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_counter() {
        let now = Instant::now();
        let mut spec = spec();
        spec.on_failure(now, &config());
        spec.on_failure(now, &config());
        spec.on_success();
        assert_eq!(spec.consecutive_failures, 0);
        assert!(!spec.on_failure(now, &config()));
        assert!(spec.enabled);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let now = Instant::now();
        let mut spec = spec();
        for _ in 0..3 {
            spec.on_failure(now, &config());
        }

        let later = now + Duration::from_millis(1_000);
        assert_eq!(spec.admit(later), Admission::Trial);
        assert!(spec.enabled);
        assert_eq!(spec.admit(later), Admission::Rejected);

        spec.on_success();
        assert_eq!(spec.consecutive_failures, 0);
        assert_eq!(spec.admit(later), Admission::Admitted);
        assert_eq!(CircuitState::of(&spec, later), CircuitState::Closed);
    }

    #[test]
    fn test_failed_trial_restarts_cooldown() {
        let now = Instant::now();
        let mut spec = spec();
        for _ in 0..3 {
            spec.on_failure(now, &config());
        }

        let later = now + Duration::from_millis(1_500);
        assert_eq!(spec.admit(later), Admission::Trial);
        assert!(spec.on_failure(later, &config()));
        assert_eq!(spec.cooldown_until, Some(later + Duration::from_millis(1_000)));
        assert_eq!(spec.admit(later + Duration::from_millis(999)), Admission::Rejected);
        assert_eq!(spec.admit(later + Duration::from_millis(1_000)), Admission::Trial);
    }

    #[test]
    fn test_cancelled_trial_frees_slot() {
        let now = Instant::now();
        let mut spec = spec();
        for _ in 0..3 {
            spec.on_failure(now, &config());
        }
        let later = now + Duration::from_secs(2);
        assert_eq!(spec.admit(later), Admission::Trial);
        spec.on_cancelled();
        assert_eq!(spec.admit(later), Admission::Trial);
    }

    #[test]
    fn test_snapshot_keeps_remaining_cooldown() {
        let now = Instant::now();
        let mut spec = spec();
        for _ in 0..3 {
            spec.on_failure(now, &config());
        }

        let snapshot = BreakerSnapshot::capture(&spec, now + Duration::from_millis(400));
        assert_eq!(snapshot.cooldown_remaining_ms, Some(600));

        let restart = now + Duration::from_secs(30);
        let mut restored = AnalyzerSpec::new("waves", 1.0, 0.1, Tier::Standard);
        snapshot.apply(&mut restored, restart);
        assert!(!restored.enabled);
        assert_eq!(restored.consecutive_failures, 3);
        assert_eq!(restored.admit(restart + Duration::from_millis(599)), Admission::Rejected);
        assert_eq!(restored.admit(restart + Duration::from_millis(600)), Admission::Trial);
    }
}
