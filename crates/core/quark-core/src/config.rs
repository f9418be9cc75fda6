//! Compile-time configuration.
//!
//! The synchronization core performs no allocation in its steady-state
//! operations, so every table it keeps has a fixed capacity chosen here.
//!
//! Lock diagnostics are selected with cfg switches rather than features so
//! that they can be flipped for a whole build via `RUSTFLAGS`:
//!
//! | cfg                | effect                                                    |
//! |--------------------|-----------------------------------------------------------|
//! | `quark_lock_debug` | spin lock recursion and sleep-under-spinlock checks in release builds (always on with `debug_assertions`) |
//! | `loom`             | atomics come from loom; lock-debug bookkeeping is off     |
//! | `shuttle`          | atomics come from shuttle; lock-debug bookkeeping is off  |

use crate::log::LogLevel;

/// Maximum number of contexts blocked on a single wait queue.
///
/// Exceeding it is fatal: it means the queue is shared far more widely
/// than the kernel was configured for.
pub const MAX_SLEEPERS: usize = 128;

/// Number of distinct contexts whose read holds an [`RwLock`] tracks.
///
/// Holds beyond this are still counted, but their owners lose the
/// nested-read exemption from writer priority.
///
/// [`RwLock`]: crate::sync::RwLock
pub const MAX_TRACKED_READERS: usize = 32;

/// Log level in effect until [`crate::log::set_max_level`] is called.
pub const DEFAULT_LOG_LEVEL: LogLevel = if cfg!(debug_assertions) {
    LogLevel::Debug
} else {
    LogLevel::Info
};

/// Maximum number of CPUs supported by per-CPU tables.
pub const MAX_CPUS: usize = 256;
