//! Sleeping reader/writer lock with writer priority.
//!
//! The lock is free, shared by `n` readers, or held by one writer. Its
//! state lives in a spin-locked word; contended requests register as
//! waiting and sleep on one of two [`WaitQueue`]s.
//!
//! # Admission
//!
//! - A read is admitted when no writer holds the lock and no writer is
//!   waiting. A context that already holds a read on this lock is exempt
//!   from the second condition, so nested reads cannot deadlock behind a
//!   writer that is itself waiting for the outer read to end.
//! - A write is admitted when the lock is free and no writer is waiting.
//!
//! # Hand-off
//!
//! Releases never just free the lock when someone waits. The releasing
//! context updates the state on the waiter's behalf and then wakes it, so
//! a woken waiter returns already holding the lock:
//!
//! - the last reader out hands the lock to one waiting writer;
//! - a writer hands it to the next waiting writer, or failing that admits
//!   every waiting reader at once.
//!
//! Waiters join their queue under the state lock, in the same critical
//! section that counts them, and releasers dequeue them under it too
//! (state lock before the wait-queue locks). The waiting counts therefore
//! always equal the queue lengths and no wakeup is ever left as a credit.
//! A waiter whose deadline passes re-takes the state lock and looks for
//! itself in its queue: if a releaser already dequeued it, the lock is
//! its; otherwise it dequeues itself and unregisters. A writer that gives
//! up this way may have been the only thing holding readers back, so it
//! admits them on its way out.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use planck_noalloc::vec::ArrayVec;

use super::waitqueue::expired;
use super::{SpinLock, SynchFlags, WaitQueue};
use crate::config::MAX_TRACKED_READERS;
use crate::cpu_local;
use crate::error::SynchError;
use crate::id::ThreadId;
use crate::sched::Scheduler;
use crate::time::Instant;

/// A context's read holds on one lock.
#[derive(Clone, Copy)]
struct ReadHold {
    thread: ThreadId,
    depth: u32,
}

struct RwState {
    readers: u32,
    write_held: bool,
    /// Set by the writer itself once it runs; `None` between a hand-off
    /// and the woken writer getting the CPU.
    writer: Option<ThreadId>,
    waiting_readers: u32,
    waiting_writers: u32,
    holds: ArrayVec<ReadHold, MAX_TRACKED_READERS>,
    /// Read holds that did not fit in `holds`.
    untracked: u32,
}

impl RwState {
    const fn new() -> Self {
        Self {
            readers: 0,
            write_held: false,
            writer: None,
            waiting_readers: 0,
            waiting_writers: 0,
            holds: ArrayVec::new(),
            untracked: 0,
        }
    }

    fn hold_index(&self, thread: ThreadId) -> Option<usize> {
        self.holds.iter().position(|h| h.thread == thread)
    }

    fn record_hold(&mut self, thread: ThreadId) {
        if let Some(idx) = self.hold_index(thread) {
            self.holds[idx].depth += 1;
        } else if self.holds.is_full() {
            self.untracked += 1;
            crate::kwarn!(
                "rwlock: read-hold table full ({MAX_TRACKED_READERS}), thread {} untracked",
                thread
            );
        } else {
            self.holds.push(ReadHold { thread, depth: 1 });
        }
    }

    /// Drops one read hold of `thread`. Returns `false` if it had none.
    fn release_hold(&mut self, thread: ThreadId) -> bool {
        if let Some(idx) = self.hold_index(thread) {
            if self.holds[idx].depth == 1 {
                self.holds.swap_remove(idx);
            } else {
                self.holds[idx].depth -= 1;
            }
            true
        } else if self.untracked > 0 {
            self.untracked -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Reader,
    Writer,
}

/// A sleeping reader/writer lock protecting a `T`.
///
/// # Example
///
/// ```ignore
/// static ROUTES: RwLock<RouteTable, KernelScheduler> = RwLock::new(RouteTable::new());
///
/// fn lookup(dst: Addr) -> Option<Route> {
///     ROUTES.read().find(dst)
/// }
/// ```
pub struct RwLock<T, S: Scheduler> {
    state: SpinLock<RwState>,
    readers_wq: WaitQueue<S>,
    writers_wq: WaitQueue<S>,
    data: UnsafeCell<T>,
}

// SAFETY: Readers share `&T` (requiring `T: Sync`); a writer gets `&mut T`
// on whatever CPU it runs (requiring `T: Send`).
unsafe impl<T: Send, S: Scheduler> Send for RwLock<T, S> {}
unsafe impl<T: Send + Sync, S: Scheduler> Sync for RwLock<T, S> {}

impl<T, S: Scheduler> RwLock<T, S> {
    /// Creates a new free `RwLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::named("rwlock", RwState::new()),
            readers_wq: WaitQueue::new(),
            writers_wq: WaitQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires a shared read hold, sleeping while a writer holds or waits.
    pub fn read(&self) -> RwLockReadGuard<'_, T, S> {
        match self.read_with(None, SynchFlags::empty()) {
            Ok(guard) => guard,
            Err(e) => unreachable!("untimed read lock failed: {e}"),
        }
    }

    /// Like [`read`](Self::read), giving up after `timeout`.
    pub fn read_timeout(
        &self,
        timeout: Duration,
    ) -> Result<RwLockReadGuard<'_, T, S>, SynchError> {
        self.read_with(Some(timeout), SynchFlags::empty())
    }

    /// Like [`read`](Self::read), but only if admission is immediate.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T, S>> {
        self.read_with(None, SynchFlags::NON_BLOCKING).ok()
    }

    /// General form of the read operations.
    ///
    /// A read request by the context holding the write lock is a usage
    /// violation.
    pub fn read_with(
        &self,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<RwLockReadGuard<'_, T, S>, SynchError> {
        let me = S::current();
        let deadline = timeout.map(|t| S::now().saturating_add(t));
        {
            let mut st = self.state.lock();
            if st.writer == Some(me) {
                drop(st);
                crate::usage_violation!(
                    "thread {} requested a read on an rwlock it holds for writing",
                    me
                );
            }
            let nested = st.hold_index(me).is_some();
            if !st.write_held && (st.waiting_writers == 0 || nested) {
                st.readers += 1;
                st.record_hold(me);
                return Ok(RwLockReadGuard::new(self));
            }
            if flags.contains(SynchFlags::NON_BLOCKING) {
                return Err(SynchError::WouldBlock);
            }
            if expired(deadline, S::now()) {
                return Err(SynchError::TimedOut);
            }
            st.waiting_readers += 1;
            self.readers_wq.enqueue(me);
        }

        self.wait_for_handoff(Role::Reader, me, deadline)?;
        Ok(RwLockReadGuard::new(self))
    }

    /// Acquires the exclusive write lock, sleeping while it is held.
    pub fn write(&self) -> RwLockWriteGuard<'_, T, S> {
        match self.write_with(None, SynchFlags::empty()) {
            Ok(guard) => guard,
            Err(e) => unreachable!("untimed write lock failed: {e}"),
        }
    }

    /// Like [`write`](Self::write), giving up after `timeout`.
    pub fn write_timeout(
        &self,
        timeout: Duration,
    ) -> Result<RwLockWriteGuard<'_, T, S>, SynchError> {
        self.write_with(Some(timeout), SynchFlags::empty())
    }

    /// Like [`write`](Self::write), but only if the lock is free now.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T, S>> {
        self.write_with(None, SynchFlags::NON_BLOCKING).ok()
    }

    /// General form of the write operations.
    ///
    /// A write request by a context that already holds this lock, for
    /// reading or writing, can never be satisfied and is a usage violation.
    pub fn write_with(
        &self,
        timeout: Option<Duration>,
        flags: SynchFlags,
    ) -> Result<RwLockWriteGuard<'_, T, S>, SynchError> {
        let me = S::current();
        let deadline = timeout.map(|t| S::now().saturating_add(t));
        {
            let mut st = self.state.lock();
            if st.writer == Some(me) {
                drop(st);
                crate::usage_violation!(
                    "thread {} requested a write on an rwlock it already holds for writing",
                    me
                );
            }
            if st.hold_index(me).is_some() {
                drop(st);
                crate::usage_violation!(
                    "thread {} requested a write on an rwlock it holds for reading (upgrade deadlock)",
                    me
                );
            }
            if !st.write_held && st.readers == 0 && st.waiting_writers == 0 {
                st.write_held = true;
                st.writer = Some(me);
                return Ok(RwLockWriteGuard::new(self));
            }
            if flags.contains(SynchFlags::NON_BLOCKING) {
                return Err(SynchError::WouldBlock);
            }
            if expired(deadline, S::now()) {
                return Err(SynchError::TimedOut);
            }
            st.waiting_writers += 1;
            self.writers_wq.enqueue(me);
        }

        self.wait_for_handoff(Role::Writer, me, deadline)?;
        Ok(RwLockWriteGuard::new(self))
    }

    /// Returns the number of read holds.
    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    /// Returns `true` if the lock is held (or has been handed) for writing.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().write_held
    }

    /// Returns the number of registered waiting readers.
    pub fn waiting_readers(&self) -> u32 {
        self.state.lock().waiting_readers
    }

    /// Returns the number of registered waiting writers.
    pub fn waiting_writers(&self) -> u32 {
        self.state.lock().waiting_writers
    }

    /// Returns a mutable reference to the data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Sleeps until a releaser hands the lock over, or `deadline` passes.
    ///
    /// The caller has already counted `me` as waiting and queued it.
    fn wait_for_handoff(
        &self,
        role: Role,
        me: ThreadId,
        deadline: Option<Instant>,
    ) -> Result<(), SynchError> {
        crate::debug_assert_usage!(
            cpu_local::held_spinlocks() == 0,
            "blocking rwlock request with {} spinlock(s) held",
            cpu_local::held_spinlocks()
        );
        let wq = match role {
            Role::Reader => &self.readers_wq,
            Role::Writer => &self.writers_wq,
        };

        let timer = deadline.map(|d| S::arm_timer(d, me));
        let outcome = loop {
            S::block();

            let mut st = self.state.lock();
            if !wq.contains(me) {
                // Handed over. The releaser already updated `readers` or
                // `write_held` on our behalf.
                match role {
                    Role::Reader => st.record_hold(me),
                    Role::Writer => st.writer = Some(me),
                }
                break Ok(());
            }
            if expired(deadline, S::now()) {
                wq.remove(me);
                self.unregister(&mut st, role);
                break Err(SynchError::TimedOut);
            }
        };
        if let Some(timer) = timer {
            S::cancel_timer(timer);
        }

        if outcome.is_err() {
            crate::ktrace!("rwlock: thread {} gave up waiting", me);
        }
        outcome
    }

    /// Withdraws a timed-out waiter. Caller holds the state lock and has
    /// dequeued the waiter.
    fn unregister(&self, st: &mut RwState, role: Role) {
        match role {
            Role::Reader => st.waiting_readers -= 1,
            Role::Writer => {
                st.waiting_writers -= 1;
                // Readers queued behind the last waiting writer would
                // otherwise sleep on a lock they may now share.
                if st.waiting_writers == 0 && !st.write_held {
                    self.admit_waiting_readers(st);
                }
            }
        }
    }

    /// Admits every waiting reader. Caller holds the state lock.
    fn admit_waiting_readers(&self, st: &mut RwState) {
        let n = st.waiting_readers;
        if n == 0 {
            return;
        }
        st.readers += n;
        st.waiting_readers = 0;
        crate::ktrace!("rwlock: admitting {} waiting reader(s)", n);
        self.readers_wq.wakeup_all();
    }

    fn read_unlock(&self) {
        let me = S::current();
        let mut st = self.state.lock();
        if st.write_held || st.readers == 0 || !st.release_hold(me) {
            drop(st);
            crate::usage_violation!("thread {} released a read hold it does not have", me);
        }
        st.readers -= 1;
        if st.readers == 0 && st.waiting_writers > 0 {
            st.waiting_writers -= 1;
            st.write_held = true;
            crate::ktrace!("rwlock: last reader {} hands off to a writer", me);
            self.writers_wq.wakeup_one();
        }
    }

    fn write_unlock(&self) {
        let me = S::current();
        let mut st = self.state.lock();
        if !st.write_held || st.writer != Some(me) {
            drop(st);
            crate::usage_violation!("thread {} released a write lock it does not hold", me);
        }
        st.writer = None;
        if st.waiting_writers > 0 {
            // Stays write-held; ownership passes to the woken writer.
            st.waiting_writers -= 1;
            crate::ktrace!("rwlock: writer {} hands off to a writer", me);
            self.writers_wq.wakeup_one();
        } else {
            st.write_held = false;
            self.admit_waiting_readers(&mut st);
        }
    }

    fn downgrade(&self) {
        let me = S::current();
        let mut st = self.state.lock();
        st.writer = None;
        st.write_held = false;
        st.readers += 1;
        st.record_hold(me);
        if st.waiting_writers == 0 {
            self.admit_waiting_readers(&mut st);
        }
    }
}

/// RAII shared hold on an [`RwLock`]. Releases it when dropped.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a, T, S: Scheduler> {
    lock: &'a RwLock<T, S>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T, S: Scheduler> RwLockReadGuard<'a, T, S> {
    fn new(lock: &'a RwLock<T, S>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T, S: Scheduler> Deref for RwLockReadGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: A read hold excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, S: Scheduler> Drop for RwLockReadGuard<'_, T, S> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// RAII exclusive hold on an [`RwLock`]. Releases it when dropped.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T, S: Scheduler> {
    lock: &'a RwLock<T, S>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T, S: Scheduler> RwLockWriteGuard<'a, T, S> {
    fn new(lock: &'a RwLock<T, S>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Turns the write lock into a read hold without releasing it.
    ///
    /// Waiting readers are admitted alongside unless a writer is waiting.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T, S> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.downgrade();
        RwLockReadGuard::new(lock)
    }
}

impl<T, S: Scheduler> Deref for RwLockWriteGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The write lock excludes everyone else.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, S: Scheduler> DerefMut for RwLockWriteGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The write lock excludes everyone else.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, S: Scheduler> Drop for RwLockWriteGuard<'_, T, S> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
