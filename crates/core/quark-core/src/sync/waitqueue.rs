//! FIFO wait queue with missed-wakeup accounting.
//!
//! A [`WaitQueue`] holds the contexts blocked on some condition, oldest
//! first. A wakeup that finds nobody waiting is not lost: it is counted in
//! `missed_wakeups`, and the next sleeper consumes it instead of blocking.
//! That counter is what makes the queue usable as a semaphore.
//!
//! # Outcome of a sleep
//!
//! A sleeper that has blocked is removed from the queue either by a waker
//! ([`wakeup_one`](WaitQueue::wakeup_one), [`wakeup_all`](WaitQueue::wakeup_all))
//! or by itself once its deadline has passed. Both removals happen under
//! the queue's spin lock, and the sleeper decides its outcome by checking
//! whether it is still queued, so a wakeup racing a timeout is reported
//! exactly once: either the sleeper was woken, or it timed out and the
//! wakeup went to someone else (or became a missed wakeup).

use core::marker::PhantomData;
use core::time::Duration;

use planck_noalloc::vec::ArrayVec;

use super::{SpinLock, SynchFlags, Wakeup, WakeupMode};
use crate::config::MAX_SLEEPERS;
use crate::cpu_local;
use crate::error::SynchError;
use crate::id::ThreadId;
use crate::sched::Scheduler;
use crate::time::Instant;

struct Inner {
    /// Blocked contexts, oldest at index 0.
    sleepers: ArrayVec<ThreadId, MAX_SLEEPERS>,
    missed_wakeups: u32,
}

impl Inner {
    fn position(&self, thread: ThreadId) -> Option<usize> {
        self.sleepers.iter().position(|&t| t == thread)
    }
}

/// A FIFO queue of blocked contexts.
pub struct WaitQueue<S: Scheduler> {
    inner: SpinLock<Inner>,
    _sched: PhantomData<fn() -> S>,
}

impl<S: Scheduler> WaitQueue<S> {
    /// Creates an empty wait queue with no pending wakeups.
    pub const fn new() -> Self {
        Self::with_missed_wakeups(0)
    }

    /// Creates an empty wait queue with `count` wakeups already pending.
    pub const fn with_missed_wakeups(count: u32) -> Self {
        Self {
            inner: SpinLock::named(
                "waitqueue",
                Inner {
                    sleepers: ArrayVec::new(),
                    missed_wakeups: count,
                },
            ),
            _sched: PhantomData,
        }
    }

    /// Sleeps until woken, consuming a missed wakeup instead if one is
    /// pending.
    pub fn sleep(&self) -> Wakeup {
        match self.sleep_with(None, SynchFlags::empty()) {
            Ok(wakeup) => wakeup,
            Err(e) => unreachable!("untimed blocking sleep failed: {e}"),
        }
    }

    /// Sleeps until woken or until `timeout` has elapsed.
    ///
    /// A zero timeout never blocks: it consumes a pending wakeup or reports
    /// [`SynchError::TimedOut`].
    pub fn sleep_timeout(&self, timeout: Duration) -> Result<Wakeup, SynchError> {
        self.sleep_with(Some(timeout), SynchFlags::empty())
    }

    /// Consumes a pending wakeup, or fails with [`SynchError::WouldBlock`].
    ///
    /// Never blocks, so it may be called with spin locks held.
    pub fn try_sleep(&self) -> Result<(), SynchError> {
        self.sleep_with(None, SynchFlags::NON_BLOCKING).map(|_| ())
    }

    /// General form of the sleep operations.
    ///
    /// Blocking (without [`SynchFlags::NON_BLOCKING`]) while holding any
    /// spin lock is a usage violation.
    pub fn sleep_with(
        &self,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<Wakeup, SynchError> {
        let non_blocking = flags.contains(SynchFlags::NON_BLOCKING);
        if !non_blocking {
            crate::debug_assert_usage!(
                cpu_local::held_spinlocks() == 0,
                "blocking sleep with {} spinlock(s) held",
                cpu_local::held_spinlocks()
            );
        }

        let deadline = timeout.map(|t| S::now().saturating_add(t));
        let me = S::current();

        {
            let mut inner = self.inner.lock();
            if inner.missed_wakeups > 0 {
                inner.missed_wakeups -= 1;
                return Ok(Wakeup::Atomic);
            }
            if non_blocking {
                return Err(SynchError::WouldBlock);
            }
            if expired(deadline, S::now()) {
                return Err(SynchError::TimedOut);
            }
            if inner.sleepers.is_full() {
                drop(inner);
                crate::usage_violation!("wait queue overflow ({MAX_SLEEPERS} sleepers)");
            }
            inner.sleepers.push(me);
        }

        let timer = deadline.map(|d| S::arm_timer(d, me));
        let outcome = loop {
            S::block();

            let mut inner = self.inner.lock();
            match inner.position(me) {
                // A waker dequeued us.
                None => break Ok(Wakeup::Blocked),
                Some(idx) if expired(deadline, S::now()) => {
                    inner.sleepers.remove(idx);
                    break Err(SynchError::TimedOut);
                }
                // Spurious return; still queued.
                Some(_) => {}
            }
        };
        if let Some(timer) = timer {
            S::cancel_timer(timer);
        }

        if outcome.is_err() {
            crate::ktrace!("waitqueue: thread {} timed out", me);
        }
        outcome
    }

    /// Wakes the oldest sleeper, or records a missed wakeup if there is
    /// none. Never blocks; callable from interrupt context.
    pub fn wakeup_one(&self) {
        let woken = {
            let mut inner = self.inner.lock();
            if inner.sleepers.is_empty() {
                inner.missed_wakeups += 1;
                None
            } else {
                Some(inner.sleepers.remove(0))
            }
        };
        if let Some(thread) = woken {
            crate::ktrace!("waitqueue: waking thread {}", thread);
            S::ready(thread);
        }
    }

    /// Wakes every current sleeper, oldest first.
    ///
    /// The missed-wakeup count is left untouched, so a wakeup-all that
    /// finds the queue empty has no effect.
    pub fn wakeup_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            core::mem::replace(&mut inner.sleepers, ArrayVec::new())
        };
        for &thread in drained.iter() {
            S::ready(thread);
        }
    }

    /// Dispatches to [`wakeup_one`](Self::wakeup_one) or
    /// [`wakeup_all`](Self::wakeup_all).
    pub fn wakeup(&self, mode: WakeupMode) {
        match mode {
            WakeupMode::First => self.wakeup_one(),
            WakeupMode::All => self.wakeup_all(),
        }
    }

    /// Returns the number of blocked contexts.
    pub fn sleepers(&self) -> usize {
        self.inner.lock().sleepers.len()
    }

    /// Returns the number of pending missed wakeups.
    pub fn missed_wakeups(&self) -> u32 {
        self.inner.lock().missed_wakeups
    }

    /// Appends `thread` without blocking or looking at missed wakeups.
    ///
    /// For primitives that register waiters under their own lock. The
    /// caller blocks afterwards and has been woken once
    /// [`contains`](Self::contains) no longer reports it.
    pub(crate) fn enqueue(&self, thread: ThreadId) {
        let mut inner = self.inner.lock();
        if inner.sleepers.is_full() {
            drop(inner);
            crate::usage_violation!("wait queue overflow ({MAX_SLEEPERS} sleepers)");
        }
        inner.sleepers.push(thread);
    }

    /// Returns `true` if `thread` is queued.
    pub(crate) fn contains(&self, thread: ThreadId) -> bool {
        self.inner.lock().position(thread).is_some()
    }

    /// Dequeues `thread` without waking it. Returns `false` if it was not
    /// queued.
    pub(crate) fn remove(&self, thread: ThreadId) -> bool {
        let mut inner = self.inner.lock();
        match inner.position(thread) {
            Some(idx) => {
                inner.sleepers.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl<S: Scheduler> Default for WaitQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}

/// Blocks the calling context for at least `duration`.
pub fn sleep_for<S: Scheduler>(duration: Duration) {
    // Nobody else can reach this queue, so only the timeout ends the sleep.
    let wq = WaitQueue::<S>::new();
    let outcome = wq.sleep_timeout(duration);
    debug_assert_eq!(outcome, Err(SynchError::TimedOut));
}
