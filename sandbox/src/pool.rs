//! Bounded concurrency for sandbox execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::SandboxError;

/// One slot of the pool. Dropping it releases the slot, including on
/// unwind, so a panicking render cannot leak capacity.
#[derive(Debug)]
pub struct SandboxPermit {
    _permit: OwnedSemaphorePermit,
}

/// A counting semaphore capping live sandboxes.
#[derive(Clone)]
pub struct SandboxPool {
    semaphore: Arc<Semaphore>,
    permit_timeout: Duration,
}

impl SandboxPool {
    /// Create a pool of `max_vms` slots (> 0).
    #[must_use]
    pub fn new(max_vms: usize, permit_timeout: Duration) -> Self {
        assert!(max_vms > 0, "pool capacity must be greater than zero");
        Self {
            semaphore: Arc::new(Semaphore::new(max_vms)),
            permit_timeout,
        }
    }

    /// Wait for a slot, up to the permit timeout.
    pub async fn acquire(&self) -> Result<SandboxPermit, SandboxError> {
        let acquired = tokio::time::timeout(
            self.permit_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| SandboxError::PermitTimeout)?;

        let permit = acquired.map_err(|_| SandboxError::Worker("pool closed".to_string()))?;
        Ok(SandboxPermit { _permit: permit })
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn capacity_is_enforced() {
        let pool = SandboxPool::new(2, Duration::from_millis(10));
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SandboxError::PermitTimeout));

        drop(first);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_holders_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        let pool = SandboxPool::new(CAPACITY, Duration::from_secs(5));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _permit = pool.acquire().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.available(), CAPACITY);
    }

    #[tokio::test]
    async fn permit_released_when_holder_panics() {
        let pool = SandboxPool::new(1, Duration::from_millis(50));
        {
            let pool = pool.clone();
            let handle = tokio::spawn(async move {
                let _permit = pool.acquire().await.unwrap();
                panic!("render blew up");
            });
            assert!(handle.await.is_err());
        }
        assert!(pool.acquire().await.is_ok());
    }
}
