//! Single-flight commit barrier.
//!
//! At most one flush may run per pool. The barrier is a binary gate
//! (Idle/Holding) guarded by a `Mutex` + `Condvar`. Acquisition is bounded by
//! a timeout and hands back a [`BarrierGuard`] whose `Drop` reopens the gate,
//! so early returns and panics inside the critical section release it too.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{OutboxError, OutboxResult};

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    waiters: usize,
}

/// Binary gate serialising flushes.
#[derive(Debug, Default)]
pub struct CommitBarrier {
    state: Mutex<GateState>,
    released: Condvar,
}

impl CommitBarrier {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // The gate state is two plain fields that are never left half-updated, so
    // a poisoned lock still holds a usable value.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout` for the gate and closes it.
    ///
    /// # Errors
    /// `OutboxError::BarrierTimeout` if the gate stayed closed for the whole timeout.
    pub fn acquire(&self, timeout: Duration) -> OutboxResult<BarrierGuard<'_>> {
        let started = Instant::now();
        let mut state = self.lock();

        if state.held {
            state.waiters += 1;
            debug!(waiters = state.waiters, "waiting for commit barrier");
            let (next, result) = self
                .released
                .wait_timeout_while(state, timeout, |s| s.held)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            state.waiters -= 1;

            if result.timed_out() && state.held {
                let waited_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
                debug!(waited_ms, "commit barrier acquire timed out");
                return Err(OutboxError::BarrierTimeout { waited_ms });
            }
        }

        state.held = true;
        trace!(
            waited_us = started.elapsed().as_micros() as u64,
            waiters = state.waiters,
            "commit barrier acquired"
        );
        Ok(BarrierGuard {
            barrier: self,
            released: false,
        })
    }

    /// Runs `body` while holding the gate.
    ///
    /// # Errors
    /// `OutboxError::BarrierTimeout` if the gate could not be taken; otherwise
    /// whatever `body` returns.
    pub fn with_barrier<T>(
        &self,
        timeout: Duration,
        body: impl FnOnce() -> OutboxResult<T>,
    ) -> OutboxResult<T> {
        let _guard = self.acquire(timeout)?;
        body()
    }

    /// Returns true while a flush holds the gate.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lock().held
    }

    /// Number of threads currently blocked in `acquire`.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    fn release(&self) {
        let mut state = self.lock();
        state.held = false;
        trace!(waiters = state.waiters, "commit barrier released");
        drop(state);
        self.released.notify_one();
    }
}

/// Proof of holding the [`CommitBarrier`]. Dropping it opens the gate.
#[derive(Debug)]
#[must_use = "the barrier is released as soon as the guard is dropped"]
pub struct BarrierGuard<'a> {
    barrier: &'a CommitBarrier,
    released: bool,
}

impl BarrierGuard<'_> {
    /// Opens the gate now. Calling it again, or dropping afterwards, does nothing.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.barrier.release();
        }
    }
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let barrier = CommitBarrier::new();
        {
            let _guard = barrier.acquire(Duration::from_millis(10)).unwrap();
            assert!(barrier.is_held());
        }
        assert!(!barrier.is_held());
        let _again = barrier.acquire(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_second_acquire_times_out() {
        let barrier = CommitBarrier::new();
        let _held = barrier.acquire(Duration::from_millis(10)).unwrap();

        let err = barrier.acquire(Duration::from_millis(30)).unwrap_err();
        let OutboxError::BarrierTimeout { waited_ms } = err else {
            panic!("expected BarrierTimeout, got {err:?}");
        };
        assert!(waited_ms >= 20);
        assert_eq!(barrier.waiters(), 0);
    }

    #[test]
    fn test_explicit_release_is_idempotent() {
        let barrier = CommitBarrier::new();
        let mut guard = barrier.acquire(Duration::from_millis(10)).unwrap();
        guard.release();
        guard.release();
        assert!(!barrier.is_held());

        let _other = barrier.acquire(Duration::from_millis(10)).unwrap();
        drop(guard);
        assert!(barrier.is_held(), "stale guard must not release a newer holder");
    }

    #[test]
    fn test_with_barrier_releases_on_error() {
        let barrier = CommitBarrier::new();
        let result: OutboxResult<()> =
            barrier.with_barrier(Duration::from_millis(10), || Err(OutboxError::Cancelled));
        assert!(matches!(result, Err(OutboxError::Cancelled)));
        assert!(!barrier.is_held());
    }

    #[test]
    fn test_released_on_panic() {
        let barrier = Arc::new(CommitBarrier::new());
        let b = Arc::clone(&barrier);
        let joined = thread::spawn(move || {
            let _guard = b.acquire(Duration::from_millis(10)).unwrap();
            panic!("flush blew up");
        })
        .join();
        assert!(joined.is_err());
        assert!(!barrier.is_held());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let barrier = Arc::new(CommitBarrier::new());
        let guard = barrier.acquire(Duration::from_millis(10)).unwrap();

        let b = Arc::clone(&barrier);
        let waiter = thread::spawn(move || b.acquire(Duration::from_secs(5)).map(|_| ()));

        while barrier.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let barrier = Arc::new(CommitBarrier::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        barrier
                            .with_barrier(Duration::from_secs(5), || {
                                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_inside.fetch_max(now, Ordering::SeqCst);
                                thread::yield_now();
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
