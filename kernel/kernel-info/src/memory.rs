//! # Memory Layout
//!
//! Canonical x86-64 address-space layout for the kernel and for every
//! process address space, plus the fixed capacities of the bounded tables
//! used by the allocators.

/// Size of one physical page frame and of the smallest mapping granule.
pub const PAGE_SIZE: u64 = 4096;

/// End of the userspace VA range; the kernel half begins above this.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Where the kernel executes (VMA).
///
/// # Linker Information
/// The kernel's linker script must agree with this.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const KERNEL_PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Physical addresses below this limit are reachable through the boot-time
/// identity map when no firmware direct-map offset is available.
pub const IDENTITY_LIMIT: u64 = 0x4000_0000; // 1 GiB

/// ISA DMA ceiling: DMA-flagged buddy allocations come from zones whose
/// base lies below this address.
pub const DMA_LIMIT: u64 = 0x0100_0000; // 16 MiB

/// Base of a process's code region.
pub const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000; // 4 MiB
/// Reserved span of the code region.
pub const USER_CODE_SIZE: u64 = 0x0040_0000; // 4 MiB
/// Base of a process's data region.
pub const USER_DATA_BASE: u64 = 0x0000_0000_0080_0000; // 8 MiB
/// Reserved span of the data region.
pub const USER_DATA_SIZE: u64 = 0x0080_0000; // 8 MiB
/// Bottom of a process's heap; the heap grows upward from here.
pub const USER_HEAP_BASE: u64 = 0x0000_0000_4000_0000; // 1 GiB
/// Top of a process's stack (exclusive); the stack grows downward.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;
/// Eagerly mapped stack span per process.
pub const USER_STACK_SIZE: u64 = 16 * PAGE_SIZE; // 64 KiB
/// One unmapped page below the stack; a fault here is an overflow report,
/// never a lazy page-in.
pub const USER_STACK_GUARD: u64 = PAGE_SIZE;

/// Bottom of the kernel heap VA window.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_ffff_c000_0000;
/// Upper bound on kernel heap growth; the heap never contracts.
pub const KERNEL_HEAP_MAX: u64 = 64 * 1024 * 1024; // 64 MiB

/// Process-table capacity (pid = slot index).
pub const MAX_PROCESSES: usize = 64;
/// Per-process VMA-list capacity.
pub const MAX_VMAS: usize = 16;
/// Reservation-registry capacity; overflow is a logged soft failure.
pub const MAX_RESERVATIONS: usize = 32;
/// Physical-region table capacity for the frame allocator.
pub const MAX_REGIONS: usize = 32;
/// Buddy zone-table capacity.
pub const MAX_ZONES: usize = 8;

/// Largest buddy order: blocks span `2^order` frames, so 4 MiB at order 10.
pub const MAX_ORDER: usize = 10;

const _: () = {
    assert!(USER_CODE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_DATA_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_TOP.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_CODE_BASE + USER_CODE_SIZE <= USER_DATA_BASE);
    assert!(USER_DATA_BASE + USER_DATA_SIZE <= USER_HEAP_BASE);
    assert!(USER_HEAP_BASE < USER_STACK_TOP - USER_STACK_SIZE - USER_STACK_GUARD);
    assert!(USER_STACK_TOP < USERSPACE_END);
    assert!(KERNEL_HEAP_BASE > USERSPACE_END);
    assert!(KERNEL_HEAP_MAX.is_multiple_of(PAGE_SIZE));
    assert!(DMA_LIMIT < IDENTITY_LIMIT);
};
