//! Recoverable outcomes of the blocking primitives.
//!
//! Usage violations (recursive spin locking, releasing a lock that is not
//! held, blocking while holding a spin lock) are not represented here:
//! they halt the kernel through [`usage_violation!`](crate::usage_violation).

use core::fmt;

/// Why a bounded or non-blocking wait did not acquire.
///
/// A caller that receives either variant does not hold the resource it
/// asked for, and no unit of it was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynchError {
    /// The deadline passed before a wakeup arrived.
    TimedOut,
    /// A non-blocking attempt found nothing available.
    WouldBlock,
}

impl fmt::Display for SynchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynchError::TimedOut => write!(f, "wait timed out"),
            SynchError::WouldBlock => write!(f, "operation would block"),
        }
    }
}

impl core::error::Error for SynchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(SynchError::TimedOut.to_string(), "wait timed out");
        assert_eq!(SynchError::WouldBlock.to_string(), "operation would block");
    }
}
