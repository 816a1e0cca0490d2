//! Per-pairing write serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::Pairing;

/// Idle entries are dropped once the map grows past this
const PRUNE_THRESHOLD: usize = 1024;

/// One async lock per pairing. Writes to different pairings never wait on
/// each other.
#[derive(Default)]
pub struct PairingLocks {
    locks: Mutex<HashMap<Pairing, Arc<AsyncMutex<()>>>>,
}

impl PairingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, pairing: Pairing) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if locks.len() >= PRUNE_THRESHOLD {
                // Only the map holds a reference to an idle lock
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(pairing).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    // The clock is paused: timeouts elapse as soon as every task is idle.

    #[tokio::test(start_paused = true)]
    async fn test_same_pairing_is_exclusive() {
        let locks = PairingLocks::new();
        let pairing = Pairing::new(1, 2);
        let guard = locks.acquire(pairing).await;

        let second = timeout(Duration::from_secs(60), locks.acquire(pairing)).await;
        assert!(second.is_err());

        drop(guard);
        let _again = locks.acquire(pairing).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_pairings_do_not_wait() {
        let locks = PairingLocks::new();
        let _a = locks.acquire(Pairing::new(1, 2)).await;
        let started = Instant::now();
        let b = timeout(Duration::from_secs(60), locks.acquire(Pairing::new(1, 3))).await;
        assert!(b.is_ok());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_runs_when_holder_releases() {
        let locks = Arc::new(PairingLocks::new());
        let pairing = Pairing::new(4, 5);
        let guard = locks.acquire(pairing).await;

        let holder = tokio::spawn(async move {
            sleep(Duration::from_secs(300)).await;
            drop(guard);
        });
        let started = Instant::now();
        let _next = locks.acquire(pairing).await;
        assert!(started.elapsed() >= Duration::from_secs(300));
        holder.await.unwrap();
    }
}
