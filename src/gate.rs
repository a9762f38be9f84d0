//! Bounded admission to heavyweight pipeline stages.
//!
//! Execution and validation drive a real browser through the automation
//! agent. [`ConcurrencyGate`] is a counting semaphore in front of those
//! stages: permits are RAII guards released on drop, whether the stage
//! succeeded, failed or panicked. Waiters are admitted in arrival order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent heavyweight stage executions.
pub const DEFAULT_CAPACITY: usize = 2;

/// The gate was closed while waiting, or before acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("concurrency gate is closed")]
pub struct GateClosed;

#[derive(Debug, Default)]
struct GateCounters {
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicU64,
}

/// Point-in-time view of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub capacity: usize,
    pub available: usize,
    pub in_flight: usize,
    pub waiting: usize,
    /// Highest number of permits ever held at once.
    pub peak: usize,
    pub admitted: u64,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

/// Held for the duration of one heavyweight stage.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps `waiting` accurate when an acquire future is dropped mid-wait.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ConcurrencyGate {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a permit. Fails once the gate is closed.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.counters.waiting);
            Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| GateClosed)?
        };

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        self.counters.admitted.fetch_add(1, Ordering::SeqCst);

        Ok(GatePermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Stop admitting work. Current holders keep their permits; every
    /// pending and future `acquire` fails with [`GateClosed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            capacity: self.capacity,
            available: self.semaphore.available_permits(),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
            admitted: self.counters.admitted.load(Ordering::SeqCst),
            closed: self.semaphore.is_closed(),
        }
    }
}
