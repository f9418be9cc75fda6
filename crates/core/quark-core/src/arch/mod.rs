//! Architecture boundary.
//!
//! The synchronization core needs exactly one thing from the CPU: masking
//! interrupt delivery on the current processor and restoring the previous
//! state afterwards. Everything else about trap entry lives in the kernel.

pub mod irq;
