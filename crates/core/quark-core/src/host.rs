//! Host platform: a [`Scheduler`] on `std::thread`.
//!
//! Every OS thread is an execution context. [`HostScheduler::block`] parks
//! the thread and [`HostScheduler::ready`] unparks it; park tokens give
//! exactly the "a ready before block is not lost" guarantee the primitives
//! rely on. Timers are served by one background thread that sleeps on a
//! condition variable until the earliest deadline.
//!
//! Used by every unit test and by host tools built with the `std` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::thread::{self, Thread};
use std::time::Instant as StdInstant;

use crate::id::ThreadId;
use crate::log::{self, LogLevel};
use crate::sched::Scheduler;
use crate::sched::timer::{TimerHandle, TimerQueue};
use crate::time::Instant;

/// Scheduler backed by OS threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostScheduler;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static THREADS: Mutex<BTreeMap<ThreadId, Thread>> = Mutex::new(BTreeMap::new());

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not take the scheduler down with it.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry entry of the current thread, removed when the thread exits.
struct Registration {
    id: ThreadId,
}

impl Registration {
    fn new() -> Self {
        let id = ThreadId::new(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        lock(&THREADS).insert(id, thread::current());
        Self { id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&THREADS).remove(&self.id);
    }
}

thread_local! {
    static CURRENT: Registration = Registration::new();
}

impl Scheduler for HostScheduler {
    type Timer = TimerHandle;

    fn current() -> ThreadId {
        CURRENT.with(|r| r.id)
    }

    fn block() {
        thread::park();
    }

    fn ready(thread: ThreadId) {
        let target = lock(&THREADS).get(&thread).cloned();
        match target {
            Some(t) => t.unpark(),
            None => crate::kdebug!("host: ready for exited thread {}", thread),
        }
    }

    fn now() -> Instant {
        static EPOCH: OnceLock<StdInstant> = OnceLock::new();
        let nanos = EPOCH.get_or_init(StdInstant::now).elapsed().as_nanos();
        Instant::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn arm_timer(deadline: Instant, thread: ThreadId) -> TimerHandle {
        start_timer_thread();
        let handle = lock(&TIMERS.queue).register(deadline, thread);
        TIMERS.changed.notify_one();
        handle
    }

    fn cancel_timer(timer: TimerHandle) {
        lock(&TIMERS.queue).cancel(timer);
    }
}

// ---------------------------------------------------------------------------
// Timer thread
// ---------------------------------------------------------------------------

struct Timers {
    queue: Mutex<TimerQueue>,
    changed: Condvar,
}

static TIMERS: Timers = Timers {
    queue: Mutex::new(TimerQueue::new()),
    changed: Condvar::new(),
};

fn start_timer_thread() {
    static START: Once = Once::new();
    START.call_once(|| {
        let spawned = thread::Builder::new()
            .name("quark-host-timer".into())
            .spawn(timer_loop);
        if let Err(e) = spawned {
            crate::kerr!("host: failed to start timer thread: {}", e);
        }
    });
}

fn timer_loop() {
    let mut queue = lock(&TIMERS.queue);
    loop {
        let now = HostScheduler::now();
        let expired = queue.expire(now);
        if !expired.is_empty() {
            drop(queue);
            for thread in expired {
                HostScheduler::ready(thread);
            }
            queue = lock(&TIMERS.queue);
            continue;
        }

        queue = match queue.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(now);
                TIMERS
                    .changed
                    .wait_timeout(queue, wait)
                    .map_or_else(|e| e.into_inner().0, |(guard, _)| guard)
            }
            None => TIMERS
                .changed
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn stderr_log(level: LogLevel, args: core::fmt::Arguments<'_>) {
    eprintln!("[{}] {}", level.name(), args);
}

/// Routes kernel log output to stderr.
pub fn init_logging() {
    // SAFETY: `stderr_log` only takes the stderr lock, which no primitive
    // of this crate ever holds.
    unsafe { log::set_log_fn(stderr_log) };
}

/// Polls `cond` until it holds, failing the test after ten seconds.
#[cfg(test)]
pub(crate) fn wait_until(cond: impl Fn() -> bool) {
    let start = StdInstant::now();
    while !cond() {
        assert!(
            start.elapsed() < std::time::Duration::from_secs(10),
            "condition not reached within 10s"
        );
        thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn current_is_stable_and_distinct() {
        let me = HostScheduler::current();
        assert_eq!(me, HostScheduler::current());
        let other = thread::spawn(HostScheduler::current).join().unwrap();
        assert_ne!(me, other);
    }

    #[test]
    fn ready_before_block_is_not_lost() {
        let me = HostScheduler::current();
        HostScheduler::ready(me);
        // Returns immediately thanks to the stored token.
        HostScheduler::block();
    }

    #[test]
    fn ready_for_exited_thread_is_ignored() {
        let gone = thread::spawn(HostScheduler::current).join().unwrap();
        wait_until(|| !lock(&THREADS).contains_key(&gone));
        HostScheduler::ready(gone);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = HostScheduler::now();
        thread::sleep(Duration::from_millis(2));
        let b = HostScheduler::now();
        assert!(b.saturating_duration_since(a) >= Duration::from_millis(2));
    }

    #[test]
    fn armed_timer_readies_thread() {
        let me = HostScheduler::current();
        let deadline = HostScheduler::now().saturating_add(Duration::from_millis(5));
        let timer = HostScheduler::arm_timer(deadline, me);
        while HostScheduler::now() < deadline {
            HostScheduler::block();
        }
        HostScheduler::cancel_timer(timer);
    }

    #[test]
    fn logging_sink_can_be_installed() {
        init_logging();
        crate::kinfo!("host logging up");
    }
}
