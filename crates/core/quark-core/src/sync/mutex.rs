//! Sleeping mutual exclusion lock.
//!
//! Unlike [`SpinLock`](super::SpinLock), a contended [`Mutex`] puts the
//! caller to sleep on a one-unit [`Semaphore`], so it may be held across
//! long operations and across other blocking calls. It must not be taken
//! from interrupt context or with a spin lock held.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use super::Semaphore;
use crate::error::SynchError;
use crate::sched::Scheduler;

/// A sleeping mutual exclusion lock protecting a `T`.
///
/// # Example
///
/// ```ignore
/// static TABLE: Mutex<Table, KernelScheduler> = Mutex::new(Table::new());
///
/// fn insert(entry: Entry) {
///     TABLE.lock().insert(entry);
/// }
/// ```
pub struct Mutex<T, S: Scheduler> {
    sem: Semaphore<S>,
    data: UnsafeCell<T>,
}

// SAFETY: The semaphore admits one holder at a time. `T: Send` is required
// because the holder may run on any CPU.
unsafe impl<T: Send, S: Scheduler> Send for Mutex<T, S> {}
unsafe impl<T: Send, S: Scheduler> Sync for Mutex<T, S> {}

impl<T, S: Scheduler> Mutex<T, S> {
    /// Creates a new unlocked `Mutex` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, sleeping while it is held elsewhere.
    pub fn lock(&self) -> MutexGuard<'_, T, S> {
        self.sem.down();
        MutexGuard::new(self)
    }

    /// Acquires the lock, giving up after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_, T, S>, SynchError> {
        self.sem.down_timeout(timeout)?;
        Ok(MutexGuard::new(self))
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, S>> {
        self.sem.try_down().then(|| MutexGuard::new(self))
    }

    /// Returns `true` if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.sem.count() == 0
    }

    /// Returns a mutable reference to the data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the mutex, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard for a [`Mutex`]. Releases the lock when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T, S: Scheduler> {
    mutex: &'a Mutex<T, S>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T, S: Scheduler> MutexGuard<'a, T, S> {
    fn new(mutex: &'a Mutex<T, S>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl<T, S: Scheduler> Deref for MutexGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holds the mutex's only unit.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, S: Scheduler> DerefMut for MutexGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the mutex's only unit.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, S: Scheduler> Drop for MutexGuard<'_, T, S> {
    fn drop(&mut self) {
        self.mutex.sem.up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostScheduler;
    use std::sync::Arc;
    use std::thread;

    type HostMutex<T> = Mutex<T, HostScheduler>;

    #[test]
    fn lock_and_mutate() {
        let m = HostMutex::new(0);
        *m.lock() += 5;
        assert_eq!(*m.lock(), 5);
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = HostMutex::new(());
        let guard = m.lock();
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
        assert_eq!(
            m.lock_timeout(Duration::from_millis(2)).err(),
            Some(SynchError::TimedOut)
        );
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        const THREADS: usize = 4;
        const ITERS: usize = 2_000;

        let m = Arc::new(HostMutex::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let mut g = m.lock();
                        let v = *g;
                        thread::yield_now();
                        *g = v + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), THREADS * ITERS);
    }

    #[test]
    fn into_inner_returns_data() {
        let mut m = HostMutex::new(vec![1]);
        m.get_mut().push(2);
        assert_eq!(m.into_inner(), [1, 2]);
    }
}
