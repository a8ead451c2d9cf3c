use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use super::breaker::{Admission, BreakerConfig};

/// Cost/quality class of a producer. A requested tier also pulls in every cheaper tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Quick,
    #[default]
    Standard,
    Critical,
}

impl Tier {
    pub fn includes(self, other: Tier) -> bool {
        other <= self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Quick => "quick",
            Tier::Standard => "standard",
            Tier::Critical => "critical",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Tier::Quick),
            "standard" => Ok(Tier::Standard),
            "critical" => Ok(Tier::Critical),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Registry-owned metadata and circuit state for one producer.
#[derive(Debug, Clone)]
pub struct AnalyzerSpec {
    pub id: String,
    pub weight: f64,
    pub cost_per_call: f64,
    pub tier: Tier,
    /// False only while `cooldown_until` lies in the future.
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<Instant>,
    pub(crate) half_open: bool,
    pub(crate) trial_in_flight: bool,
}

impl AnalyzerSpec {
    pub fn new(id: impl Into<String>, weight: f64, cost_per_call: f64, tier: Tier) -> Self {
        Self {
            id: id.into(),
            weight,
            cost_per_call,
            tier,
            enabled: true,
            consecutive_failures: 0,
            cooldown_until: None,
            half_open: false,
            trial_in_flight: false,
        }
    }

    pub fn is_half_open(&self) -> bool {
        self.half_open
    }

    /// Re-enables the producer for a half-open trial once its cool-down has elapsed.
    pub(crate) fn refresh(&mut self, now: Instant) {
        if !self.enabled {
            if let Some(until) = self.cooldown_until {
                if now >= until {
                    self.enabled = true;
                    self.half_open = true;
                    self.trial_in_flight = false;
                }
            }
        }
    }

    /// Whether a call could be admitted right now, without claiming the trial slot.
    pub(crate) fn is_available(&self, now: Instant) -> bool {
        let mut probe = self.clone();
        probe.refresh(now);
        probe.enabled && !(probe.half_open && probe.trial_in_flight)
    }

    pub(crate) fn admit(&mut self, now: Instant) -> Admission {
        self.refresh(now);
        if !self.enabled {
            return Admission::Rejected;
        }
        if self.half_open {
            if self.trial_in_flight {
                return Admission::Rejected;
            }
            self.trial_in_flight = true;
            return Admission::Trial;
        }
        Admission::Admitted
    }

    pub(crate) fn on_success(&mut self) {
        if !self.enabled {
            // late answer from a call issued before the circuit opened
            return;
        }
        self.consecutive_failures = 0;
        self.half_open = false;
        self.trial_in_flight = false;
        self.cooldown_until = None;
    }

    /// Returns true when this failure opened the circuit.
    pub(crate) fn on_failure(&mut self, now: Instant, config: &BreakerConfig) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.enabled {
            return false;
        }
        if self.half_open || self.consecutive_failures >= config.failure_threshold {
            self.enabled = false;
            self.half_open = false;
            self.trial_in_flight = false;
            self.cooldown_until = Some(now + config.cooldown());
            return true;
        }
        false
    }

    /// A call was abandoned without an answer; frees the half-open trial slot.
    pub(crate) fn on_cancelled(&mut self) {
        if self.half_open {
            self.trial_in_flight = false;
        }
    }
}
