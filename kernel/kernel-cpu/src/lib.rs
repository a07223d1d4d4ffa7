//! # CPU Paging Primitives
//!
//! The only place in the memory engine with target-specific assembly:
//! CR3 access and TLB maintenance. Everything above this crate works on
//! plain values and can run in host tests; on hosted targets these
//! functions compile to no-ops so the stack above stays testable.
//!
//! # Platform
//!
//! `x86_64`, bare metal (`target_os = "none"`); all operations require
//! CPL0 with paging enabled.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

/// Read the physical address of the active PML4 from CR3.
///
/// The low 12 bits carry PCID/flags and are masked off.
///
/// # Safety
/// Must run at CPL0 with paging enabled.
#[inline]
#[must_use]
pub unsafe fn read_cr3() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        cr3 & !0xfff
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Load CR3 with `root`, switching the active address space.
///
/// Implicitly flushes all non-global TLB entries.
///
/// # Safety
/// `root` must be the 4 KiB-aligned physical address of a valid PML4 whose
/// kernel-half mappings cover the currently executing code and stack.
#[inline]
pub unsafe fn write_cr3(root: u64) {
    debug_assert_eq!(root & 0xfff, 0);
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = root;
    }
}

/// Invalidate the TLB entry for the page containing `va`.
///
/// # Safety
/// CPL0 only. Required after changing a live mapping for `va`.
#[inline]
pub unsafe fn invlpg(va: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = va;
    }
}

/// Flush all non-global TLB entries by reloading CR3.
///
/// # Safety
/// CPL0 with paging enabled.
#[inline]
pub unsafe fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}
