//! Fatal diagnostics for misuse of the synchronization primitives.
//!
//! Continuing after a usage violation (recursive spin locking, releasing a
//! lock nobody holds, sleeping with a spin lock held) would corrupt shared
//! kernel state, so these macros log at [`Fatal`](crate::log::LogLevel::Fatal)
//! and then panic. The kernel's panic handler halts.
//!
//! | Macro                | Checked                                             |
//! |----------------------|-----------------------------------------------------|
//! | [`usage_violation!`] | unconditionally, at the call site                   |
//! | [`assert_usage!`]    | always                                              |
//! | [`debug_assert_usage!`] | with `debug_assertions` or `quark_lock_debug`; type-checked otherwise |

/// Reports a usage violation and halts.
#[macro_export]
macro_rules! usage_violation {
    ($($arg:tt)+) => {{
        $crate::kfatal!("usage violation: {}", format_args!($($arg)+));
        panic!("usage violation: {}", format_args!($($arg)+));
    }};
}

/// Halts with a usage violation if `cond` is false.
#[macro_export]
macro_rules! assert_usage {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::usage_violation!($($arg)+);
        }
    };
}

/// Like [`assert_usage!`], but only checked in lock-debug builds.
///
/// In other builds the condition is still type-checked to prevent bitrot.
#[macro_export]
macro_rules! debug_assert_usage {
    ($cond:expr, $($arg:tt)+) => {
        #[cfg(any(debug_assertions, quark_lock_debug))]
        {
            $crate::assert_usage!($cond, $($arg)+);
        }
        #[cfg(not(any(debug_assertions, quark_lock_debug)))]
        {
            if false {
                let _ = $cond;
            }
        }
    };
}
