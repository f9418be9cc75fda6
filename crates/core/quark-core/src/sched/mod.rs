//! Scheduler boundary.
//!
//! The blocking primitives never pick the next thread to run. They only
//! need to name the current context, put it to sleep, make another one
//! runnable again and read a clock. [`Scheduler`] is that contract; the
//! kernel implements it on its run queues, and the host implements it on
//! `std::thread` in [`crate::host`].

pub mod timer;

use crate::id::ThreadId;
use crate::time::Instant;

/// Operations the synchronization core consumes from the scheduler.
///
/// All methods are associated functions: a kernel has exactly one
/// scheduler, and the primitives carry it as a type parameter rather than
/// a pointer.
pub trait Scheduler: 'static {
    /// Handle for an armed timer, returned by [`arm_timer`](Self::arm_timer).
    type Timer;

    /// Returns the handle of the calling context.
    fn current() -> ThreadId;

    /// Suspends the calling context until it is made ready.
    ///
    /// Token semantics: a [`ready`](Self::ready) that arrives before the
    /// context blocks is not lost, and `block` then returns immediately.
    /// May also return spuriously; callers re-check their condition.
    fn block();

    /// Makes `thread` runnable.
    ///
    /// Must be callable from any context, including with interrupts masked.
    fn ready(thread: ThreadId);

    /// Returns the current time on the monotonic clock.
    fn now() -> Instant;

    /// Arranges for [`ready`](Self::ready)`(thread)` to be called once
    /// [`now`](Self::now) reaches `deadline`.
    fn arm_timer(deadline: Instant, thread: ThreadId) -> Self::Timer;

    /// Disarms a timer. Cancelling a timer that already fired is a no-op.
    fn cancel_timer(timer: Self::Timer);
}
