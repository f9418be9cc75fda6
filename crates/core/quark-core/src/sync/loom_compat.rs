//! Loom/shuttle compatibility shim.
//!
//! With `cfg(loom)` the spin lock flag is a loom atomic and spinning yields
//! to loom's scheduler. With `cfg(shuttle)` the flag stays a `core` atomic
//! but spinning yields to shuttle, so a spinner never starves the holder of
//! a randomly scheduled run. Otherwise everything comes from `core`.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, Ordering};

/// Called once per iteration of a spin-wait loop.
#[inline]
pub(crate) fn spin_hint() {
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(all(shuttle, not(loom)))]
    shuttle::thread::yield_now();
    #[cfg(not(any(loom, shuttle)))]
    core::hint::spin_loop();
}
