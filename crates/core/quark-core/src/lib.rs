//! Synchronization core of the Quark kernel.
//!
//! This crate contains the primitives every other kernel subsystem builds
//! on to touch shared state safely from several processors and from
//! interrupt context: interrupt-masking spin locks, FIFO wait queues with
//! missed-wakeup accounting, counting semaphores, a sleeping mutex and a
//! writer-priority reader/writer lock.
//!
//! The blocking primitives are generic over a [`sched::Scheduler`], the
//! boundary through which they block, wake and time out execution
//! contexts. The kernel supplies its own implementation; host builds (the
//! `std` feature, and every `cargo test` run) get [`host::HostScheduler`],
//! which maps contexts onto `std::thread`s.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod cpu_local;
pub mod error;
pub mod id;
pub mod log;
pub mod safety;
pub mod sched;
pub mod sync;
pub mod time;

#[cfg(any(test, feature = "std"))]
pub mod host;

pub use error::SynchError;
pub use id::ThreadId;
pub use time::Instant;
