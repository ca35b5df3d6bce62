//! Global transfer limiter.
//!
//! One semaphore bounds in-flight object operations across every mount, so
//! the `concurrency` cap is a process-wide cap and not a per-mount one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Shared bound on concurrent object transfers.
///
/// Tracks an in-flight count and its high-water mark so tests can observe
/// that the cap holds.
#[derive(Debug)]
pub struct TransferLimiter {
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl TransferLimiter {
    /// Create a limiter of the given capacity (must be ≥ 1).
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Semaphore::new(capacity),
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        })
    }

    /// Acquire a transfer token, waiting until one is free.
    ///
    /// The token is released when the returned permit drops, on every exit
    /// path.
    pub async fn acquire(&self) -> TransferPermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("limiter semaphore is never closed");
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(current, Ordering::SeqCst);
        TransferPermit {
            _permit: permit,
            limiter: self,
        }
    }

    /// Number of transfers currently holding a token.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The most transfers ever simultaneously in flight.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

/// RAII token for one object transfer.
pub struct TransferPermit<'a> {
    _permit: SemaphorePermit<'a>,
    limiter: &'a TransferLimiter,
}

impl Drop for TransferPermit<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cap_holds_under_contention() {
        let limiter = TransferLimiter::new(2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(limiter.high_water() <= 2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = TransferLimiter::new(1);
        {
            let _permit = limiter.acquire().await;
            assert_eq!(limiter.in_flight(), 1);
        }
        assert_eq!(limiter.in_flight(), 0);
        // A second acquire must not block.
        let _again = limiter.acquire().await;
    }
}
