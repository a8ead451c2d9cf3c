use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Error, PartialEq)]
#[error("call limiter is closed")]
pub struct LimiterClosed;

/// Process-wide cap on simultaneously outstanding producer calls, shared by
/// every in-flight evaluation so downstream rate limits hold under load.
pub struct CallLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    total_acquired: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl CallLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        tracing::info!("🛡️  Call limiter initialized: {} concurrent producer calls", capacity);

        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            total_acquired: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub async fn acquire(&self) -> Result<CallPermit, LimiterClosed> {
        let start = Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        let waited = start.elapsed();
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);

        if waited.as_millis() > 100 {
            tracing::debug!("⏳ Waited {:?} for a producer call slot", waited);
        }

        Ok(CallPermit { _permit: permit })
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn get_stats(&self) -> CallLimiterStats {
        let available = self.semaphore.available_permits();
        CallLimiterStats {
            capacity: self.capacity,
            in_use: self.capacity.saturating_sub(available),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard that releases the call slot when dropped
#[derive(Debug)]
pub struct CallPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallLimiterStats {
    pub capacity: usize,
    pub in_use: usize,
    pub total_acquired: u64,
    pub total_wait_ms: u64,
}

impl CallLimiterStats {
    pub fn usage_percent(&self) -> f64 {
        self.in_use as f64 / self.capacity as f64 * 100.0
    }

    pub fn format_status(&self) -> String {
        let status_icon = if self.usage_percent() < 70.0 {
            "🟢"
        } else if self.usage_percent() < 90.0 {
            "🟡"
        } else {
            "🔴"
        };

        format!(
            "{} Producer calls: {}/{} ({:.1}%) | Total: {}",
            status_icon,
            self.in_use,
            self.capacity,
            self.usage_percent(),
            self.total_acquired
        )
    }
}
