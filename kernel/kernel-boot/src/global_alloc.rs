//! [`GlobalAlloc`] adapter over the kernel heap.
//!
//! Deliberately not self-registering: the kernel binary declares the
//! `#[global_allocator]` static itself, pointing at its [`KernelMemory`]
//! instance, so this crate stays usable in host tests that keep the
//! host's own allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::KernelMemory;

/// Heap payloads are offset by a 16-byte header within 16-byte-granular
/// blocks, so this is the strongest alignment the heap can promise.
const MAX_ALIGN: usize = 16;

/// Routes `alloc`/`dealloc` to the kernel heap behind the surface lock.
pub struct KernelAllocator {
    mem: &'static KernelMemory,
}

impl KernelAllocator {
    #[must_use]
    pub const fn new(mem: &'static KernelMemory) -> Self {
        Self { mem }
    }
}

// SAFETY: the surface serializes all heap access; pointers handed out are
// heap payload pointers valid until passed back to `dealloc`.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            log::error!("kernel heap cannot satisfy alignment {}", layout.align());
            return ptr::null_mut();
        }
        match self.mem.heap_alloc(layout.size().max(1)) {
            Some(p) => p.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            log::error!("kernel heap cannot satisfy alignment {}", layout.align());
            return ptr::null_mut();
        }
        match self.mem.heap_zalloc(layout.size().max(1)) {
            Some(p) => p.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // The heap validates the header itself; a failure here is a bug
        // worth shouting about, not worth crashing the allocator over.
        if let Err(e) = self.mem.heap_free(ptr) {
            log::error!("global dealloc rejected: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_aligned_requests_are_refused_without_touching_the_engine() {
        // An uninitialized surface: reaching the heap would panic, so a
        // null return proves the request was refused up front.
        let mem: &'static KernelMemory = Box::leak(Box::new(KernelMemory::new()));
        let alloc = KernelAllocator::new(mem);
        let layout = Layout::from_size_align(64, 32).unwrap();
        assert!(unsafe { alloc.alloc(layout) }.is_null());
        assert!(unsafe { alloc.alloc_zeroed(layout) }.is_null());
        // Null dealloc is a no-op.
        unsafe { alloc.dealloc(ptr::null_mut(), layout) };
    }
}
