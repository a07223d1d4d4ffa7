//! Physical→virtual translation for kernel code.
//!
//! Page tables, frame zeroing and the heap all need CPU-dereferenceable
//! pointers to physical memory. Three windows can provide one, tried in
//! order:
//!
//! 1. the firmware/bootloader **direct map** (`virt = phys + offset`),
//!    covering all of RAM when present;
//! 2. the **kernel image** mapping, for the kernel's own load range;
//! 3. the boot **identity map**, for addresses below its fixed limit.
//!
//! All three windows are static for the platform's lifetime, which is why
//! `unmap_mmio_region` is a no-op.

use kernel_info::memory::{IDENTITY_LIMIT, KERNEL_BASE, KERNEL_PHYS_LOAD};
use kernel_vmem::{PhysAddr, PhysMapper, VirtAddr};

use crate::ReservationRegistry;

/// Configured translation windows; built once by the bootstrap layer.
#[derive(Copy, Clone, Debug)]
pub struct DirectMap {
    /// `virt = phys + offset` over all RAM, when the firmware provides it.
    hhdm_offset: Option<u64>,
    /// Exclusive physical end of the kernel image ([`KERNEL_PHYS_LOAD`]
    /// plus image size).
    kernel_phys_end: u64,
}

impl DirectMap {
    #[must_use]
    pub const fn new(hhdm_offset: Option<u64>, kernel_image_size: u64) -> Self {
        Self {
            hhdm_offset,
            kernel_phys_end: KERNEL_PHYS_LOAD + kernel_image_size,
        }
    }

    /// An identity direct map (`offset == 0`); what host tests use to make
    /// physical addresses plain pointers.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            hhdm_offset: Some(0),
            kernel_phys_end: KERNEL_PHYS_LOAD,
        }
    }

    /// Apply the window resolution order without consulting reservations.
    #[must_use]
    pub fn resolve(&self, pa: PhysAddr) -> Option<VirtAddr> {
        let p = pa.as_u64();
        if let Some(offset) = self.hhdm_offset {
            return Some(VirtAddr::new(p + offset));
        }
        if (KERNEL_PHYS_LOAD..self.kernel_phys_end).contains(&p) {
            return Some(VirtAddr::new(KERNEL_BASE + (p - KERNEL_PHYS_LOAD)));
        }
        if p < IDENTITY_LIMIT {
            return Some(VirtAddr::new(p));
        }
        None
    }

    /// Translate `pa` to a dereferenceable kernel pointer.
    ///
    /// Reservations marked non-translatable are rejected; everything else
    /// follows the window resolution order. `None` means no window covers
    /// the address.
    #[must_use]
    pub fn phys_to_virt(&self, registry: &ReservationRegistry, pa: PhysAddr) -> Option<VirtAddr> {
        if !registry.is_translatable(pa) {
            log::warn!("refusing to translate reserved address {pa}");
            return None;
        }
        self.resolve(pa)
    }

    /// Resolve a device-register range to a pointer.
    ///
    /// The range must be non-empty and translatable end to end. MMIO
    /// reservations carry the translatable flag precisely so this succeeds
    /// while allocation stays blocked.
    #[must_use]
    pub fn map_mmio_region(
        &self,
        registry: &ReservationRegistry,
        pa: PhysAddr,
        size: u64,
    ) -> Option<VirtAddr> {
        if size == 0 {
            log::warn!("zero-length MMIO mapping request at {pa}");
            return None;
        }
        let last = PhysAddr::new(pa.as_u64() + size - 1);
        if !registry.is_translatable(pa) || !registry.is_translatable(last) {
            log::warn!("refusing MMIO mapping into non-translatable range at {pa}");
            return None;
        }
        self.resolve(pa)
    }

    /// Direct-map windows are static; there is nothing to tear down.
    pub fn unmap_mmio_region(&self, _va: VirtAddr, _size: u64) {}
}

impl PhysMapper for DirectMap {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        // The unsafe contract already requires `pa` to be mapped for the
        // caller; outside every window the boot identity mapping applies.
        let va = match self.resolve(pa) {
            Some(va) => va,
            None => VirtAddr::new(pa.as_u64()),
        };
        // SAFETY: per the trait contract, `pa` is mapped writable and `T`
        // matches the bytes behind it.
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}
