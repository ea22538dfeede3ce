//! Critical-path barrier.
//!
//! Critical dispatches are counted per epoch. `wait` closes the current epoch
//! (anything dispatched afterwards belongs to the next cycle) and returns once
//! no critical job from a closed epoch is outstanding. Non-critical jobs are
//! never registered here.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct BarrierState {
    epoch: u64,
    outstanding: BTreeMap<u64, usize>,
}

#[derive(Debug, Default)]
pub struct CriticalBarrier {
    state: Mutex<BarrierState>,
    settled: Notify,
}

impl CriticalBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one critical dispatch; returns the epoch it belongs to.
    pub fn register(&self) -> u64 {
        let mut state = self.lock();
        let epoch = state.epoch;
        *state.outstanding.entry(epoch).or_default() += 1;
        epoch
    }

    /// A critical job of `epoch` finished.
    pub fn complete(&self, epoch: u64) {
        let drained = {
            let mut state = self.lock();
            match state.outstanding.get_mut(&epoch) {
                Some(n) if *n > 1 => {
                    *n -= 1;
                    false
                }
                Some(_) => {
                    state.outstanding.remove(&epoch);
                    true
                }
                None => {
                    warn!(epoch, "critical completion for an epoch with nothing outstanding");
                    false
                }
            }
        };
        if drained {
            self.settled.notify_waiters();
        }
    }

    /// Critical jobs not yet completed, across all epochs.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.values().sum()
    }

    fn pending_through(&self, epoch: u64) -> usize {
        self.lock().outstanding.range(..=epoch).map(|(_, n)| n).sum()
    }

    /// Block until every critical job dispatched before this call completed.
    pub async fn wait(&self) {
        let closed = {
            let mut state = self.lock();
            let closed = state.epoch;
            state.epoch += 1;
            closed
        };

        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let pending = self.pending_through(closed);
            if pending == 0 {
                return;
            }
            debug!(epoch = closed, pending, "waiting for critical tasks");
            settled.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_with_nothing_outstanding_returns() {
        let barrier = CriticalBarrier::new();
        tokio::time::timeout(Duration::from_millis(50), barrier.wait())
            .await
            .expect("empty barrier must not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_complete() {
        let barrier = Arc::new(CriticalBarrier::new());
        let a = barrier.register();
        let b = barrier.register();
        assert_eq!(barrier.outstanding(), 2);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.complete(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.complete(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier released")
            .unwrap();
        assert_eq!(barrier.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_later_dispatch_counts_for_next_cycle() {
        let barrier = Arc::new(CriticalBarrier::new());
        let first = barrier.register();

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Issued after the barrier call began: belongs to the next epoch.
        let second = barrier.register();
        assert_ne!(first, second);
        barrier.complete(first);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("first epoch drained")
            .unwrap();
        assert_eq!(barrier.outstanding(), 1);
    }
}
