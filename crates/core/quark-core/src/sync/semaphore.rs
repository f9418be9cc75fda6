//! Counting semaphore.
//!
//! [`Semaphore`] is a [`WaitQueue`] whose missed-wakeup counter *is* the
//! semaphore count: `up` wakes the oldest sleeper or adds a unit, `down`
//! consumes a unit or sleeps. A unit released while someone sleeps goes
//! straight to that sleeper, so a late arrival can never overtake it.

use core::time::Duration;

use super::{SynchFlags, WaitQueue, Wakeup};
use crate::error::SynchError;
use crate::sched::Scheduler;

/// A counting semaphore.
///
/// # Example
///
/// ```ignore
/// static SLOTS: Semaphore<KernelScheduler> = Semaphore::new(3);
///
/// fn use_slot() {
///     let _permit = SLOTS.acquire();
///     // ... at most three contexts run here at once ...
/// }
/// ```
pub struct Semaphore<S: Scheduler> {
    wq: WaitQueue<S>,
}

impl<S: Scheduler> Semaphore<S> {
    /// Creates a semaphore holding `count` units.
    pub const fn new(count: u32) -> Self {
        Self {
            wq: WaitQueue::with_missed_wakeups(count),
        }
    }

    /// Releases one unit. Never blocks; callable from interrupt context.
    pub fn up(&self) {
        self.wq.wakeup_one();
    }

    /// Takes one unit, sleeping until one is available.
    pub fn down(&self) {
        self.wq.sleep();
    }

    /// Takes one unit, giving up after `timeout`.
    ///
    /// On [`SynchError::TimedOut`] no unit was consumed.
    pub fn down_timeout(&self, timeout: Duration) -> Result<(), SynchError> {
        self.wq.sleep_timeout(timeout).map(|_| ())
    }

    /// Takes one unit if one is available right now.
    pub fn try_down(&self) -> bool {
        self.wq.try_sleep().is_ok()
    }

    /// General form of `down`: see [`WaitQueue::sleep_with`].
    pub fn down_with(
        &self,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<Wakeup, SynchError> {
        self.wq.sleep_with(timeout, flags)
    }

    /// Returns the number of available units.
    ///
    /// Zero while contexts are waiting.
    pub fn count(&self) -> u32 {
        self.wq.missed_wakeups()
    }

    /// Returns the number of contexts blocked in `down`.
    pub fn waiters(&self) -> usize {
        self.wq.sleepers()
    }

    /// Takes one unit and returns a permit that releases it on drop.
    pub fn acquire(&self) -> SemaphorePermit<'_, S> {
        self.down();
        SemaphorePermit { sem: self }
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<SemaphorePermit<'_, S>, SynchError> {
        self.down_timeout(timeout)?;
        Ok(SemaphorePermit { sem: self })
    }

    /// Like [`acquire`](Self::acquire), without blocking.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_, S>> {
        self.try_down().then(|| SemaphorePermit { sem: self })
    }
}

/// RAII permit that releases its unit back to the [`Semaphore`] on drop.
#[must_use = "dropping the permit releases the unit immediately"]
pub struct SemaphorePermit<'a, S: Scheduler> {
    sem: &'a Semaphore<S>,
}

impl<S: Scheduler> SemaphorePermit<'_, S> {
    /// Keeps the unit taken: the permit is dropped without calling `up`.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl<S: Scheduler> Drop for SemaphorePermit<'_, S> {
    fn drop(&mut self) {
        self.sem.up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostScheduler, wait_until};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    type Sem = Semaphore<HostScheduler>;

    #[test]
    fn count_tracks_up_and_down() {
        let sem = Sem::new(2);
        assert_eq!(sem.count(), 2);
        sem.down();
        assert!(sem.try_down());
        assert!(!sem.try_down());
        assert_eq!(sem.count(), 0);
        sem.up();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn up_before_down_is_not_lost() {
        let sem = Sem::new(0);
        sem.up();
        assert_eq!(
            sem.down_with(None, SynchFlags::NON_BLOCKING),
            Ok(Wakeup::Atomic)
        );
    }

    #[test]
    fn down_timeout_consumes_nothing_on_failure() {
        let sem = Sem::new(0);
        assert_eq!(
            sem.down_timeout(Duration::from_millis(5)),
            Err(SynchError::TimedOut)
        );
        assert_eq!(sem.count(), 0);
        sem.up();
        assert_eq!(sem.down_timeout(Duration::from_millis(5)), Ok(()));
    }

    #[test]
    fn up_hands_unit_to_sleeper() {
        let sem = Arc::new(Sem::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.down())
        };
        wait_until(|| sem.waiters() == 1);
        sem.up();
        waiter.join().unwrap();
        // The unit went to the sleeper, not to the count.
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn permits_release_on_drop() {
        let sem = Sem::new(1);
        {
            let _p = sem.acquire();
            assert!(sem.try_acquire().is_none());
        }
        assert_eq!(sem.count(), 1);
        let p = sem.acquire_timeout(Duration::from_millis(1)).unwrap();
        p.forget();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn bounded_consumers_with_timeouts() {
        // Eight consumers fight over five units with short timeouts; at no
        // point may more than five hold a unit.
        const UNITS: u32 = 5;
        const CONSUMERS: usize = 8;

        let sem = Arc::new(Sem::new(UNITS));
        let holding = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let holding = Arc::clone(&holding);
                let max_seen = Arc::clone(&max_seen);
                let acquired = Arc::clone(&acquired);
                thread::spawn(move || {
                    for _ in 0..50 {
                        if sem.down_timeout(Duration::from_micros(200)).is_ok() {
                            let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            acquired.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                            holding.fetch_sub(1, Ordering::SeqCst);
                            sem.up();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= UNITS as usize);
        assert!(acquired.load(Ordering::Relaxed) > 0);
        // Every unit taken was given back, none were lost to timeouts.
        assert_eq!(sem.count(), UNITS);
    }
}
