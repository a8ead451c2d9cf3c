use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("computation for key {key} failed: {message}")]
    ComputationFailed { key: String, message: String },
    #[error("computation task for key {key} aborted: {message}")]
    TaskAborted { key: String, message: String },
}

/// How a lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Waited on a computation another caller started.
    Joined,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Joined => "joined",
        }
    }

    pub fn is_cached(&self) -> bool {
        !matches!(self, CacheStatus::Miss)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
}

type SharedComputation<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

enum Slot<V: Clone> {
    Ready {
        value: V,
        stored_at: Instant,
    },
    InFlight {
        generation: u64,
        computation: SharedComputation<V>,
    },
}

/// TTL-bound memoization with at most one computation in flight per key.
///
/// The computation runs on its own task, so a caller that gives up waiting
/// does not cancel it for the others. Failures reach every waiter and the key
/// is evicted so the next request starts over.
pub struct ResponseCache<V: Clone + Send + Sync + 'static> {
    slots: Arc<Mutex<HashMap<String, Slot<V>>>>,
    ttl_ms: AtomicU64,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        tracing::info!("🗄️  Response cache initialized (ttl {}ms)", ttl.as_millis());
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            next_generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Applies to stored entries as well.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<(V, CacheStatus), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let ttl = self.ttl();
        let mut slots = self.slots.lock().await;

        let in_flight = match slots.get(key) {
            Some(Slot::Ready { value, stored_at }) if stored_at.elapsed() < ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("🎯 Cache hit for {}", key);
                return Ok((value.clone(), CacheStatus::Hit));
            }
            Some(Slot::InFlight { computation, .. }) => Some(computation.clone()),
            _ => None,
        };

        if let Some(computation) = in_flight {
            drop(slots);
            self.joined.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("⏳ Joining in-flight computation for {}", key);
            return computation.await.map(|value| (value, CacheStatus::Joined));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let computation = self.spawn_computation(key.to_string(), generation, compute());

        slots.insert(
            key.to_string(),
            Slot::InFlight {
                generation,
                computation: computation.clone(),
            },
        );
        drop(slots);

        computation.await.map(|value| (value, CacheStatus::Miss))
    }

    fn spawn_computation<Fut, E>(
        &self,
        key: String,
        generation: u64,
        work: Fut,
    ) -> SharedComputation<V>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let slots = self.slots.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result.map_err(|e| CacheError::ComputationFailed {
                    key: task_key.clone(),
                    message: e.to_string(),
                }),
                Err(payload) => Err(CacheError::TaskAborted {
                    key: task_key.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };

            let mut slots = slots.lock().await;
            if owns_slot(&slots, &task_key, generation) {
                match &outcome {
                    Ok(value) => {
                        slots.insert(
                            task_key,
                            Slot::Ready {
                                value: value.clone(),
                                stored_at: Instant::now(),
                            },
                        );
                    }
                    Err(err) => {
                        tracing::warn!("❌ {}; evicting key", err);
                        slots.remove(&task_key);
                    }
                }
            }
            outcome
        });

        let slots = self.slots.clone();
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let mut slots = slots.lock().await;
                    if owns_slot(&slots, &key, generation) {
                        slots.remove(&key);
                    }
                    Err(CacheError::TaskAborted {
                        key,
                        message: join_err.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drops every completed entry older than the TTL; returns how many.
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.ttl();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { stored_at, .. } => stored_at.elapsed() < ttl,
            Slot::InFlight { .. } => true,
        });
        let purged = before - slots.len();
        if purged > 0 {
            tracing::debug!("🧹 Purged {} expired cache entries", purged);
        }
        purged
    }

    /// An in-flight computation for the key still completes for its waiters
    /// but is not stored.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.slots.lock().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let slots = self.slots.lock().await;
        let in_flight = slots
            .values()
            .filter(|s| matches!(s, Slot::InFlight { .. }))
            .count();
        CacheStats {
            entries: slots.len() - in_flight,
            in_flight,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

fn owns_slot<V: Clone>(slots: &HashMap<String, Slot<V>>, key: &str, generation: u64) -> bool {
    matches!(
        slots.get(key),
        Some(Slot::InFlight { generation: g, .. }) if *g == generation
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("computation panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("computation panicked: {}", message)
    } else {
        "computation panicked".to_string()
    }
}
