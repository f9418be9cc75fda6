//! Interrupt-state save/restore.
//!
//! [`save_and_disable`] masks interrupt delivery on the current processor
//! and returns the previous state; [`restore`] puts it back. [`IrqGuard`]
//! pairs the two so that the restore happens on every exit path.
//!
//! Hosted builds with `std` emulate the interrupt-enable flag per OS
//! thread, so tests can observe that a spin lock masks interrupts while
//! held. Other hosted builds treat the operations as no-ops.

use core::marker::PhantomData;

/// Saved interrupt state of one processor.
///
/// Holds the raw flags register on bare metal (RFLAGS on x86_64, DAIF on
/// aarch64) and the emulated enable bit on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a saved interrupt state must be handed back to `restore`"]
pub struct IrqState(u64);

impl IrqState {
    /// Returns `true` if interrupts were enabled when this state was saved.
    pub fn were_enabled(self) -> bool {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        {
            self.0 & RFLAGS_IF != 0
        }
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        {
            self.0 & DAIF_I == 0
        }
        #[cfg(not(target_os = "none"))]
        {
            self.0 != 0
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
const DAIF_I: u64 = 1 << 7;

/// Masks interrupts on the current processor, returning the prior state.
#[inline]
pub fn save_and_disable() -> IrqState {
    IrqState(save_flags_and_cli())
}

/// Restores an interrupt state previously returned by [`save_and_disable`].
///
/// States must be restored in the reverse order they were saved.
#[inline]
pub fn restore(state: IrqState) {
    restore_flags(state.0);
}

/// Returns `true` if interrupts are currently enabled on this processor.
#[inline]
pub fn are_enabled() -> bool {
    let state = save_and_disable();
    restore(state);
    state.were_enabled()
}

/// RAII interrupt mask: interrupts stay masked until the guard drops.
///
/// `!Send`: the saved state belongs to the processor that saved it.
pub struct IrqGuard {
    saved: IrqState,
    _not_send: PhantomData<*const ()>,
}

impl IrqGuard {
    /// Masks interrupts and remembers the prior state.
    #[inline]
    pub fn new() -> Self {
        Self {
            saved: save_and_disable(),
            _not_send: PhantomData,
        }
    }

    /// Returns the state that will be restored on drop.
    pub fn saved(&self) -> IrqState {
        self.saved
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        restore(self.saved);
    }
}

// ---------------------------------------------------------------------------
// Bare metal
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore_flags(flags: u64) {
    // Only IF is restored; the other RFLAGS bits are not ours to touch.
    if flags & RFLAGS_IF != 0 {
        // SAFETY: Re-enabling interrupts restores a previously saved state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading DAIF and masking interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "mrs {}, DAIF",
            "msr DAIFSet, #0xf",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn restore_flags(flags: u64) {
    // SAFETY: Restoring DAIF puts back a previously saved state.
    unsafe {
        core::arch::asm!(
            "msr DAIF, {}",
            in(reg) flags,
            options(nomem, nostack, preserves_flags),
        );
    }
}

// ---------------------------------------------------------------------------
// Host emulation
// ---------------------------------------------------------------------------

#[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
std::thread_local! {
    static HOST_IRQ_ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

#[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
#[inline]
fn save_flags_and_cli() -> u64 {
    HOST_IRQ_ENABLED.with(|flag| u64::from(flag.replace(false)))
}

#[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
#[inline]
fn restore_flags(flags: u64) {
    HOST_IRQ_ENABLED.with(|flag| flag.set(flags != 0));
}

#[cfg(all(not(target_os = "none"), not(any(test, feature = "std"))))]
#[inline]
fn save_flags_and_cli() -> u64 {
    1
}

#[cfg(all(not(target_os = "none"), not(any(test, feature = "std"))))]
#[inline]
fn restore_flags(_flags: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_by_default() {
        assert!(are_enabled());
    }

    #[test]
    fn save_and_restore() {
        let state = save_and_disable();
        assert!(state.were_enabled());
        assert!(!are_enabled());
        restore(state);
        assert!(are_enabled());
    }

    #[test]
    fn nested_guards_restore_in_order() {
        let outer = IrqGuard::new();
        assert!(outer.saved().were_enabled());
        {
            let inner = IrqGuard::new();
            assert!(!inner.saved().were_enabled());
            assert!(!are_enabled());
        }
        // The inner guard restores "disabled", not "enabled".
        assert!(!are_enabled());
        drop(outer);
        assert!(are_enabled());
    }

    #[test]
    fn state_is_per_thread() {
        let _guard = IrqGuard::new();
        let other = std::thread::spawn(are_enabled).join().unwrap();
        assert!(other);
        assert!(!are_enabled());
    }
}
