use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::trace;

use crate::{targets, Error, Result};

/// Counting admission control for one class of operations.
///
/// Backed by a tokio [`Semaphore`], which queues waiters in FIFO order. A
/// permit is returned when the [`LimiterPermit`] guard drops, so every exit
/// path of the guarded block releases exactly once.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    name: &'static str,
    limit: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<LimiterStats>,
}

#[derive(Debug, Default)]
struct LimiterStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
}

pub struct LimiterPermit<'a> {
    _permit: SemaphorePermit<'a>,
    stats: &'a LimiterStats,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            stats: Arc::new(LimiterStats::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn acquire(&self) -> Result<LimiterPermit<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::LimiterClosed { name: self.name })?;

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(in_flight, Ordering::SeqCst);
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        trace!(
            target: targets::LIMITER,
            limiter = self.name,
            in_flight,
            limit = self.limit,
            "Permit acquired"
        );

        Ok(LimiterPermit {
            _permit: permit,
            stats: &self.stats,
        })
    }

    /// Runs `future` while holding a permit.
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(future.await)
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen so far.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> usize {
        self.stats.acquired.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
