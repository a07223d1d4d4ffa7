//! The kernel-wide memory surface.
//!
//! One [`KernelMemory`] instance (a kernel-level `static`) owns the
//! [`MemoryContext`] behind an interrupt-masking spin lock. The allocators
//! themselves carry no locking; serializing every entry point here is what
//! keeps an interrupt handler from observing a half-updated free list.
//!
//! Use before [`init`](KernelMemory::init) panics: there is no meaningful
//! degraded mode for a kernel without memory.

use core::ptr::NonNull;

use kernel_alloc::{AllocFlags, BuddyError, FrameError, HeapError};
use kernel_sync::SpinLock;
use kernel_vm::{Pid, VmError};
use kernel_vmem::{MapError, MapFlags, PageSize, PhysAddr, UnmapError, VirtAddr};

use crate::context::{BootError, BootInfo, MemoryContext};

/// The locked memory engine; the one memory API the rest of the kernel
/// sees.
pub struct KernelMemory {
    ctx: SpinLock<Option<MemoryContext>>,
}

impl KernelMemory {
    /// An uninitialized surface, suitable for a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ctx: SpinLock::new(None),
        }
    }

    /// Run the bootstrap sequence. Fails instead of panicking, for callers
    /// (and tests) that want to inspect the error.
    pub fn try_init(&self, info: &BootInfo<'_>) -> Result<(), BootError> {
        let mut guard = self.ctx.lock_irq();
        if guard.is_some() {
            return Err(BootError::AlreadyInitialized);
        }
        *guard = Some(MemoryContext::init(info)?);
        Ok(())
    }

    /// Run the bootstrap sequence, panicking on failure. The single
    /// intended panic site of the memory engine.
    pub fn init(&self, info: &BootInfo<'_>) {
        if let Err(e) = self.try_init(info) {
            panic!("memory bootstrap failed: {e}");
        }
    }

    /// Run `f` on the engine under the lock.
    fn with<R>(&self, f: impl FnOnce(&mut MemoryContext) -> R) -> R {
        let mut guard = self.ctx.lock_irq();
        match guard.as_mut() {
            Some(ctx) => f(ctx),
            None => panic!("kernel memory used before bootstrap"),
        }
    }

    // ---- frames and blocks ---------------------------------------------

    pub fn alloc_frame(&self, flags: AllocFlags) -> Option<PhysAddr> {
        self.with(|ctx| ctx.alloc_frame(flags))
    }

    pub fn free_frame(&self, pa: PhysAddr) -> Result<(), FrameError> {
        self.with(|ctx| ctx.free_frame(pa))
    }

    pub fn retain_frame(&self, pa: PhysAddr) -> Result<(), FrameError> {
        self.with(|ctx| ctx.retain_frame(pa))
    }

    pub fn alloc_pages(&self, count: u64, flags: AllocFlags) -> Option<PhysAddr> {
        self.with(|ctx| ctx.alloc_pages(count, flags))
    }

    pub fn free_pages(&self, pa: PhysAddr) -> Result<(), BuddyError> {
        self.with(|ctx| ctx.free_pages(pa))
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.with(|ctx| ctx.free_frames())
    }

    #[must_use]
    pub fn buddy_free_bytes(&self) -> u64 {
        self.with(|ctx| ctx.buddy_free_bytes())
    }

    // ---- kernel mappings -----------------------------------------------

    /// Map one 4 KiB page into the kernel address space. No TLB work is
    /// needed: the entry goes absent → present, and absent entries are
    /// never cached.
    pub fn map_page(&self, va: VirtAddr, pa: PhysAddr, flags: MapFlags) -> Result<(), MapError> {
        self.with(|ctx| ctx.map_page(va, pa, flags))
    }

    /// Unmap the kernel page at `va` and invalidate its TLB entry.
    pub fn unmap_page(&self, va: VirtAddr) -> Result<PageSize, UnmapError> {
        let size = self.with(|ctx| ctx.unmap_page(va))?;
        // SAFETY: CPL0; the mapping was just removed from the live space.
        unsafe { kernel_cpu::invlpg(va.as_u64()) };
        Ok(size)
    }

    #[must_use]
    pub fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.with(|ctx| ctx.virt_to_phys(va))
    }

    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.with(|ctx| ctx.phys_to_virt(pa))
    }

    #[must_use]
    pub fn map_mmio_region(&self, pa: PhysAddr, size: u64) -> Option<VirtAddr> {
        self.with(|ctx| ctx.map_mmio_region(pa, size))
    }

    pub fn unmap_mmio_region(&self, va: VirtAddr, size: u64) {
        self.with(|ctx| ctx.unmap_mmio_region(va, size));
    }

    // ---- kernel heap ---------------------------------------------------

    pub fn heap_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.with(|ctx| ctx.heap_alloc(size))
    }

    pub fn heap_zalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.with(|ctx| ctx.heap_zalloc(size))
    }

    pub fn heap_free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.with(|ctx| ctx.heap_free(ptr))
    }

    // ---- process address spaces ----------------------------------------

    pub fn create_process_vm(&self) -> Result<Pid, VmError> {
        self.with(MemoryContext::create_process_vm)
    }

    pub fn destroy_process_vm(&self, pid: Pid) {
        self.with(|ctx| ctx.destroy_process_vm(pid));
    }

    #[must_use]
    pub fn get_page_dir(&self, pid: Pid) -> Option<PhysAddr> {
        self.with(|ctx| ctx.get_page_dir(pid))
    }

    /// Load CR3 with the process's page-table root.
    ///
    /// # Safety
    /// The target root's kernel half must cover the currently executing
    /// code and stack; every root this engine creates does.
    pub unsafe fn switch_to_process(&self, pid: Pid) -> Result<(), VmError> {
        let root = self
            .with(|ctx| ctx.get_page_dir(pid))
            .ok_or(VmError::UnknownProcess)?;
        // SAFETY: per the function contract plus the engine's invariant
        // that every process root mirrors the kernel half.
        unsafe { kernel_cpu::write_cr3(root.as_u64()) };
        Ok(())
    }

    pub fn process_alloc(&self, pid: Pid, size: u64) -> Result<VirtAddr, VmError> {
        self.with(|ctx| ctx.process_alloc(pid, size))
    }

    pub fn process_free(&self, pid: Pid, vaddr: VirtAddr, size: u64) -> Result<(), VmError> {
        self.with(|ctx| ctx.process_free(pid, vaddr, size))
    }

    /// Page-fault entry point for the trap handler.
    pub fn handle_page_fault(&self, pid: Pid, addr: VirtAddr) -> Result<(), VmError> {
        self.with(|ctx| ctx.handle_page_fault(pid, addr))
    }
}

impl Default for KernelMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::{PAGE_SIZE, USER_CODE_BASE, USER_HEAP_BASE};
    use kernel_mmap::{MemoryMapEntry, RegionKind};

    fn entry(base: u64, length: u64, kind: RegionKind) -> MemoryMapEntry {
        MemoryMapEntry {
            base: PhysAddr::new(base),
            length,
            kind,
        }
    }

    /// Fake RAM behind a direct-map offset; same shape as the context
    /// tests, exercised through the locked surface instead.
    fn boot_info() -> BootInfo<'static> {
        let buf: &'static mut [u8] =
            Box::leak(vec![0u8; 9 * 1024 * 1024].into_boxed_slice());
        let base = kernel_vmem::align_up(buf.as_ptr() as u64, PAGE_SIZE);
        let entries = Box::leak(Box::new([
            entry(0x0, 0x9_f000, RegionKind::Usable),
            entry(0x10_0000, 0x10_0000, RegionKind::KernelImage),
            entry(0x20_0000, 0x60_0000, RegionKind::Usable),
        ]));
        BootInfo {
            memory_map: entries,
            direct_map_offset: Some(base),
            kernel_image_size: 0x10_0000,
        }
    }

    #[test]
    #[should_panic(expected = "used before bootstrap")]
    fn use_before_init_panics() {
        let mem = KernelMemory::new();
        let _ = mem.alloc_frame(AllocFlags::empty());
    }

    #[test]
    fn double_init_is_rejected() {
        let mem = KernelMemory::new();
        let info = boot_info();
        mem.init(&info);
        assert_eq!(mem.try_init(&info), Err(BootError::AlreadyInitialized));
    }

    #[test]
    fn frame_and_mapping_ops_through_the_lock() {
        let mem = KernelMemory::new();
        mem.init(&boot_info());

        let frame = mem.alloc_frame(AllocFlags::ZERO).unwrap();
        let va = VirtAddr::new(0xffff_ffff_b200_0000);
        mem.map_page(va, frame, MapFlags::WRITABLE).unwrap();
        assert_eq!(mem.virt_to_phys(va), Some(frame));
        assert_eq!(mem.unmap_page(va), Ok(PageSize::Size4K));
        assert_eq!(mem.virt_to_phys(va), None);
        mem.free_frame(frame).unwrap();

        let block = mem.alloc_pages(2, AllocFlags::ZERO).unwrap();
        mem.free_pages(block).unwrap();
    }

    #[test]
    fn process_lifecycle_through_the_lock() {
        let mem = KernelMemory::new();
        mem.init(&boot_info());
        let baseline = mem.free_frames();

        let pid = mem.create_process_vm().unwrap();
        assert!(mem.get_page_dir(pid).is_some());

        // Fault in a code page, grow and free the heap.
        mem.handle_page_fault(pid, VirtAddr::new(USER_CODE_BASE + 0x40))
            .unwrap();
        let heap = mem.process_alloc(pid, 3 * PAGE_SIZE).unwrap();
        assert_eq!(heap.as_u64(), USER_HEAP_BASE);
        mem.process_free(pid, heap, 3 * PAGE_SIZE).unwrap();

        // Switching to a live process is a no-op on hosted targets but
        // must resolve the root; an unknown pid must not.
        unsafe {
            mem.switch_to_process(pid).unwrap();
            assert_eq!(mem.switch_to_process(42), Err(VmError::UnknownProcess));
        }

        mem.destroy_process_vm(pid);
        assert_eq!(mem.get_page_dir(pid), None);
        assert_eq!(mem.free_frames(), baseline);
    }
}
