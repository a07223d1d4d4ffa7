//! Interrupt masking for critical sections.
//!
//! Hardware interrupts can fire at any instruction boundary even on a
//! single cooperative core, so free-list splices and page-table edits are
//! wrapped in [`SpinLock::lock_irq`]: save `RFLAGS.IF`, `cli`, take the
//! lock, and restore in reverse order on drop.

use crate::{SpinLock, SpinLockGuard};

/// Disables hardware interrupts (`cli`). No-op on hosted targets.
///
/// # Platform
/// `x86/x86_64`, privileged context only.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`). No-op on hosted targets.
///
/// # Platform
/// `x86/x86_64`, privileged context only.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled. Hosted targets
/// report 0 so [`IrqGuard`] never issues `sti` there.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(target_os = "none")]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Snapshots the `IF` bit; `sti` is issued on drop **only** if interrupts
/// were enabled when the guard was created, preserving the original state.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// A spin-lock guard that also keeps interrupts disabled while held.
pub struct IrqSpinLock<'a, T> {
    _irq: IrqGuard,
    guard: SpinLockGuard<'a, T>,
}

impl<T> SpinLock<T> {
    /// Acquires the lock with interrupts disabled for the guard's lifetime.
    ///
    /// Disables interrupts first, then spins; the reverse order could let an
    /// interrupt handler spin forever on a lock its own CPU holds.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLock<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLock { _irq: irq, guard }
    }
}

impl<T> core::ops::Deref for IrqSpinLock<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for IrqSpinLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
