//! Deadline-ordered timer list.
//!
//! A scheduler records `(deadline, thread)` pairs here from
//! [`Scheduler::arm_timer`](super::Scheduler::arm_timer) and calls
//! [`TimerQueue::expire`] from its clock tick to collect the threads whose
//! deadline has passed. The queue itself is not synchronized; the owner
//! wraps it in whatever lock suits its tick context.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::id::ThreadId;
use crate::time::Instant;

/// Identifies one registration in a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    deadline: Instant,
    seq: u64,
}

impl TimerHandle {
    /// Returns the deadline this timer was armed for.
    pub fn deadline(self) -> Instant {
        self.deadline
    }
}

/// Pending timers, ordered by deadline and then by registration order.
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), ThreadId>,
    next_seq: u64,
}

impl TimerQueue {
    /// Creates an empty timer queue.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Registers `thread` to be woken at `deadline`.
    pub fn register(&mut self, deadline: Instant, thread: ThreadId) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), thread);
        TimerHandle { deadline, seq }
    }

    /// Removes a registration. Returns `false` if it already expired.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.entries.remove(&(handle.deadline, handle.seq)).is_some()
    }

    /// Removes and returns every thread whose deadline is at or before
    /// `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<ThreadId> {
        let mut expired = Vec::new();
        while let Some((&(deadline, _), _)) = self.entries.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some((_, thread)) = self.entries.pop_first() {
                expired.push(thread);
            }
        }
        expired
    }

    /// Returns the earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Returns the number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ns: u64) -> Instant {
        Instant::from_nanos(ns)
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.register(at(30), ThreadId::new(3));
        q.register(at(10), ThreadId::new(1));
        q.register(at(20), ThreadId::new(2));
        assert_eq!(q.next_deadline(), Some(at(10)));

        assert_eq!(q.expire(at(20)), [ThreadId::new(1), ThreadId::new(2)]);
        assert_eq!(q.len(), 1);
        assert!(q.expire(at(25)).is_empty());
        assert_eq!(q.expire(at(30)), [ThreadId::new(3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_registration_order() {
        let mut q = TimerQueue::new();
        for i in 0..4 {
            q.register(at(5), ThreadId::new(i));
        }
        let woken = q.expire(at(5));
        assert_eq!(woken, (0..4).map(ThreadId::new).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_removes_only_that_timer() {
        let mut q = TimerQueue::new();
        let a = q.register(at(5), ThreadId::new(1));
        let _b = q.register(at(5), ThreadId::new(2));
        assert_eq!(a.deadline(), at(5));
        assert!(q.cancel(a));
        assert!(!q.cancel(a));
        assert_eq!(q.expire(at(5)), [ThreadId::new(2)]);
    }

    #[test]
    fn cancel_after_expiry_is_noop() {
        let mut q = TimerQueue::new();
        let a = q.register(at(1), ThreadId::new(1));
        assert_eq!(q.expire(at(2)).len(), 1);
        assert!(!q.cancel(a));
    }
}
