//! Synchronization primitives for the kernel.
//!
//! Layered bottom-up: [`SpinLock`] masks interrupts and spins;
//! [`WaitQueue`] blocks contexts in FIFO order and remembers wakeups that
//! found nobody waiting; [`Semaphore`] is a wait queue whose missed-wakeup
//! count is the semaphore count; [`Mutex`] is a one-unit semaphore around
//! data; [`RwLock`] is a writer-priority reader/writer lock built on one
//! spin-locked state word and two wait queues.
//!
//! Everything above the spin lock is generic over a
//! [`Scheduler`](crate::sched::Scheduler).

pub(crate) mod loom_compat;
mod spinlock;

#[cfg(not(loom))]
mod mutex;
#[cfg(not(loom))]
mod rwlock;
#[cfg(not(loom))]
mod semaphore;
#[cfg(not(loom))]
pub mod waitqueue;


pub use spinlock::RawSpinLock;
#[cfg(not(loom))]
pub use spinlock::{SpinLock, SpinLockGuard};

#[cfg(not(loom))]
pub use mutex::{Mutex, MutexGuard};
#[cfg(not(loom))]
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
#[cfg(not(loom))]
pub use semaphore::{Semaphore, SemaphorePermit};
#[cfg(not(loom))]
pub use waitqueue::{WaitQueue, sleep_for};

bitflags::bitflags! {
    /// Modifiers for the general sleep and acquire operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SynchFlags: u32 {
        /// Do not block: succeed only if the resource is available now,
        /// otherwise fail with [`SynchError::WouldBlock`](crate::SynchError::WouldBlock).
        const NON_BLOCKING = 1 << 0;
    }
}

/// Which sleepers a [`WaitQueue::wakeup`] releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupMode {
    /// The oldest sleeper, or one missed-wakeup credit if nobody sleeps.
    First,
    /// Every current sleeper. Leaves no credit behind.
    All,
}

/// How a successful sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A pending missed wakeup was consumed; the caller never blocked.
    Atomic,
    /// The caller blocked and was then removed from the queue by a waker.
    Blocked,
}
