//! Minimal per-CPU storage and the current-CPU identity.
//!
//! On bare-metal targets the CPU id is read from the GS-based per-CPU
//! block. On hosted builds with `std` every OS thread plays the role of a
//! CPU: it gets a unique id on first use, and per-CPU counters live in
//! thread-locals. That keeps recursion and sleep-under-spinlock checks
//! meaningful in multi-threaded host tests.

use core::sync::atomic::AtomicU32;
#[cfg(any(target_os = "none", all(any(test, feature = "std"), not(target_os = "none"))))]
use core::sync::atomic::Ordering;

pub use crate::config::MAX_CPUS;

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// Falls back to CPU 0's slot if the id is out of range, which only
    /// happens before per-CPU data is set up on an application processor.
    pub fn get(&self) -> &T {
        let id = current_cpu_id() as usize;
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu_id >= MAX_CPUS`.
    pub fn get_for(&self, cpu_id: u32) -> &T {
        &self.data[cpu_id as usize]
    }
}

// SAFETY: Each CPU only accesses its own slot; cross-CPU reads go through
// `get_for` and require `T: Sync` semantics from the element type (atomics).
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

/// Returns the current CPU ID.
#[inline]
pub fn current_cpu_id() -> u32 {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        if !cpu_is_initialized() {
            return 0;
        }
        // SAFETY: GS:[24] holds the `cpu_id` field of the per-CPU block once
        // GS base has been set up, which `cpu_is_initialized` confirmed.
        unsafe {
            let id: u32;
            core::arch::asm!("mov {:e}, gs:[24]", out(reg) id, options(readonly, nostack));
            id
        }
    }
    #[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
    {
        host_cpu_id()
    }
    #[cfg(not(any(
        all(target_os = "none", target_arch = "x86_64"),
        all(not(target_os = "none"), any(test, feature = "std"))
    )))]
    {
        0
    }
}

/// Returns whether the current CPU's per-CPU block has been initialized.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn cpu_is_initialized() -> bool {
    // SAFETY: GS:[0] holds the self pointer. Before GS base is set up it
    // reads low memory, which is never a kernel upper-half address.
    unsafe {
        let self_ptr: u64;
        core::arch::asm!("mov {}, gs:[0]", out(reg) self_ptr, options(readonly, nostack));
        if self_ptr < 0xFFFF_8000_0000_0000 {
            return false;
        }
        let init: u8;
        core::arch::asm!("mov {}, gs:[29]", out(reg_byte) init, options(readonly, nostack));
        init != 0
    }
}

#[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
fn host_cpu_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    std::thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

// ---------------------------------------------------------------------------
// Spin lock nesting depth
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", not(any(loom, shuttle))))]
static SPIN_DEPTH: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

#[cfg(all(not(target_os = "none"), any(test, feature = "std"), not(any(loom, shuttle))))]
std::thread_local! {
    static SPIN_DEPTH: AtomicU32 = const { AtomicU32::new(0) };
}

/// Returns the number of spin locks held by the current CPU.
///
/// Always zero under loom and shuttle, and on hosted builds without
/// `std`, where there is no per-context storage to count in.
pub fn held_spinlocks() -> u32 {
    #[cfg(all(target_os = "none", not(any(loom, shuttle))))]
    {
        SPIN_DEPTH.get().load(Ordering::Relaxed)
    }
    #[cfg(all(not(target_os = "none"), any(test, feature = "std"), not(any(loom, shuttle))))]
    {
        SPIN_DEPTH.with(|d| d.load(Ordering::Relaxed))
    }
    #[cfg(not(all(
        any(target_os = "none", any(test, feature = "std")),
        not(any(loom, shuttle))
    )))]
    {
        0
    }
}

pub(crate) fn spin_acquired() {
    #[cfg(all(target_os = "none", not(any(loom, shuttle))))]
    SPIN_DEPTH.get().fetch_add(1, Ordering::Relaxed);
    #[cfg(all(not(target_os = "none"), any(test, feature = "std"), not(any(loom, shuttle))))]
    SPIN_DEPTH.with(|d| d.fetch_add(1, Ordering::Relaxed));
}

pub(crate) fn spin_released() {
    #[cfg(all(target_os = "none", not(any(loom, shuttle))))]
    SPIN_DEPTH.get().fetch_sub(1, Ordering::Relaxed);
    #[cfg(all(not(target_os = "none"), any(test, feature = "std"), not(any(loom, shuttle))))]
    SPIN_DEPTH.with(|d| d.fetch_sub(1, Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_for_indexes_slots() {
        let local = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
        local.get_for(3).store(7, Ordering::Relaxed);
        assert_eq!(local.get_for(3).load(Ordering::Relaxed), 7);
        assert_eq!(local.get_for(4).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn host_threads_get_distinct_ids() {
        let here = current_cpu_id();
        let there = std::thread::spawn(current_cpu_id).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, current_cpu_id());
    }

    #[test]
    fn spin_depth_counts_per_thread() {
        assert_eq!(held_spinlocks(), 0);
        spin_acquired();
        spin_acquired();
        assert_eq!(held_spinlocks(), 2);
        let other = std::thread::spawn(held_spinlocks).join().unwrap();
        assert_eq!(other, 0);
        spin_released();
        spin_released();
        assert_eq!(held_spinlocks(), 0);
    }
}
