//! Zone-based buddy allocator for contiguous multi-page blocks.
//!
//! Every block is a naturally aligned power-of-two run of frames within
//! its zone; two blocks of the same order that share a parent are buddies,
//! and the buddy of block `i` at order `k` is `i XOR 2^k`. Splitting is
//! the only way a smaller block comes into existence, merging the only way
//! a larger one does, so the power-of-two invariant holds by construction.
//!
//! Free lists are doubly linked `u32` zone-local frame indices into a flat
//! descriptor arena; no pointers are chased.
//!
//! Zones are carved by the bootstrap layer and are disjoint from the frame
//! allocator's inventory, so the two allocators can never both own a byte.

use kernel_info::memory::{DMA_LIMIT, MAX_ORDER, MAX_ZONES, PAGE_SIZE};
use kernel_mmap::RegionKind;
use kernel_vmem::PhysAddr;

use crate::{AllocFlags, NIL};

/// Tracking state of one frame-granular descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BlockState {
    /// Interior of some block; carries no information of its own.
    Untracked,
    /// First frame of a free block of `order`.
    Free,
    /// First frame of an allocated block of `order`.
    Allocated,
}

/// Descriptor for one frame inside a buddy zone.
#[derive(Copy, Clone, Debug)]
pub struct BlockDesc {
    state: BlockState,
    order: u8,
    next: u32,
    prev: u32,
}

impl BlockDesc {
    /// Initial value for freshly carved descriptor storage.
    pub const UNTRACKED: Self = Self {
        state: BlockState::Untracked,
        order: 0,
        next: NIL,
        prev: NIL,
    };
}

#[derive(Copy, Clone)]
struct Zone {
    base: u64,
    /// Frames in the zone.
    frames: u32,
    /// Index of the zone's frame 0 in the shared descriptor arena.
    desc_offset: u32,
    free_heads: [u32; MAX_ORDER + 1],
    free_counts: [u32; MAX_ORDER + 1],
}

const EMPTY_ZONE: Zone = Zone {
    base: 0,
    frames: 0,
    desc_offset: 0,
    free_heads: [NIL; MAX_ORDER + 1],
    free_counts: [0; MAX_ORDER + 1],
};

/// Rejected buddy operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    /// The address lies in no registered zone, or not on a block head.
    #[error("address does not name an allocated block")]
    UnknownAddress,
    /// `free_pages` on a block that is not allocated (double free).
    #[error("block is not in the allocated state")]
    NotAllocated,
    /// The bounded zone table is full.
    #[error("zone table is full")]
    ZoneTableFull,
    /// The descriptor arena cannot cover another zone of that size.
    #[error("descriptor storage exhausted")]
    StorageExhausted,
}

/// Power-of-two physical block allocator over disjoint zones.
pub struct BuddyAllocator {
    descs: &'static mut [BlockDesc],
    zones: [Zone; MAX_ZONES],
    zone_count: usize,
    descs_used: u32,
}

impl BuddyAllocator {
    /// Take ownership of descriptor storage; zones carve slices out of it
    /// as they are added.
    pub fn new(descs: &'static mut [BlockDesc]) -> Self {
        descs.fill(BlockDesc::UNTRACKED);
        Self {
            descs,
            zones: [EMPTY_ZONE; MAX_ZONES],
            zone_count: 0,
            descs_used: 0,
        }
    }

    /// Register `[base, base+size)` as a zone and carve it into the
    /// largest naturally aligned power-of-two blocks that fit.
    ///
    /// Only usable regions are accepted; partial edge pages are trimmed.
    pub fn add_zone(
        &mut self,
        base: PhysAddr,
        size: u64,
        kind: RegionKind,
    ) -> Result<(), BuddyError> {
        if !kind.is_usable() {
            return Ok(());
        }
        let start = kernel_vmem::align_up(base.as_u64(), PAGE_SIZE);
        let end = kernel_vmem::align_down(base.as_u64() + size, PAGE_SIZE);
        if end <= start {
            return Ok(());
        }
        if self.zone_count == MAX_ZONES {
            log::warn!("zone table full, dropping zone at {base}");
            return Err(BuddyError::ZoneTableFull);
        }
        let frames = ((end - start) / PAGE_SIZE) as u32;
        if self.descs_used as usize + frames as usize > self.descs.len() {
            log::warn!("buddy descriptor storage exhausted at {base}");
            return Err(BuddyError::StorageExhausted);
        }

        let zi = self.zone_count;
        self.zones[zi] = Zone {
            base: start,
            frames,
            desc_offset: self.descs_used,
            free_heads: [NIL; MAX_ORDER + 1],
            free_counts: [0; MAX_ORDER + 1],
        };
        self.zone_count += 1;
        self.descs_used += frames;

        // Greedy carve: the order at each step is capped by the natural
        // alignment of the running index and by what remains.
        let mut local: u32 = 0;
        while local < frames {
            let align_order = if local == 0 {
                MAX_ORDER
            } else {
                (local.trailing_zeros() as usize).min(MAX_ORDER)
            };
            let remaining = frames - local;
            let fit_order = (31 - remaining.leading_zeros()) as usize;
            let order = align_order.min(fit_order).min(MAX_ORDER);
            self.insert_free(zi, local, order);
            local += 1 << order;
        }
        log::debug!("buddy zone {:#x}..{:#x} ({frames} frames)", start, end);
        Ok(())
    }

    /// Allocate `2^ceil(log2(count))` contiguous frames.
    ///
    /// Scans free lists from the minimal order upward; a larger block is
    /// split down, linking each cut-off buddy into the next-lower list.
    /// [`AllocFlags::DMA`] restricts the search to zones below the ISA
    /// limit. Returns `None` when no zone can satisfy the request.
    pub fn alloc_pages(&mut self, count: u64, flags: AllocFlags) -> Option<PhysAddr> {
        if count == 0 {
            log::warn!("zero-page buddy allocation request");
            return None;
        }
        let order = count.next_power_of_two().trailing_zeros() as usize;
        if order > MAX_ORDER {
            log::warn!("buddy request of {count} pages exceeds the maximum order");
            return None;
        }

        for zi in 0..self.zone_count {
            if flags.contains(AllocFlags::DMA) && self.zones[zi].base >= DMA_LIMIT {
                continue;
            }
            let Some(found) = (order..=MAX_ORDER).find(|&o| self.zones[zi].free_heads[o] != NIL)
            else {
                continue;
            };

            let local = self.zones[zi].free_heads[found];
            self.remove_free(zi, local, found);

            // Split down to the requested order, one halving at a time.
            let mut o = found;
            while o > order {
                o -= 1;
                self.insert_free(zi, local + (1 << o), o);
            }

            let d = self.desc_mut(zi, local);
            d.state = BlockState::Allocated;
            d.order = order as u8;
            return Some(PhysAddr::new(
                self.zones[zi].base + u64::from(local) * PAGE_SIZE,
            ));
        }
        None
    }

    /// Return a block and merge it with its free buddies as far up as
    /// possible.
    pub fn free_pages(&mut self, pa: PhysAddr) -> Result<(), BuddyError> {
        let Some(zi) = (0..self.zone_count).find(|&zi| {
            let z = &self.zones[zi];
            let p = pa.as_u64();
            z.base <= p && p < z.base + u64::from(z.frames) * PAGE_SIZE
        }) else {
            log::error!("buddy free of unmanaged address {pa}");
            return Err(BuddyError::UnknownAddress);
        };
        if !pa.is_aligned(PAGE_SIZE) {
            log::error!("buddy free of unaligned address {pa}");
            return Err(BuddyError::UnknownAddress);
        }

        let mut local = ((pa.as_u64() - self.zones[zi].base) / PAGE_SIZE) as u32;
        let head = *self.desc_mut(zi, local);
        if head.state != BlockState::Allocated {
            log::error!("buddy double free at {pa} (state {:?})", head.state);
            return Err(BuddyError::NotAllocated);
        }
        self.desc_mut(zi, local).state = BlockState::Untracked;

        let mut order = head.order as usize;
        while order < MAX_ORDER {
            let buddy = local ^ (1 << order);
            if buddy + (1 << order) > self.zones[zi].frames {
                break;
            }
            let bd = *self.desc_mut(zi, buddy);
            if bd.state != BlockState::Free || bd.order as usize != order {
                break;
            }
            // Absorb the buddy; the pair promotes to the next order.
            self.remove_free(zi, buddy, order);
            self.desc_mut(zi, buddy).state = BlockState::Untracked;
            local = local.min(buddy);
            order += 1;
        }
        self.insert_free(zi, local, order);
        Ok(())
    }

    /// Free blocks of `order` across all zones.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> u32 {
        self.zones[..self.zone_count]
            .iter()
            .map(|z| z.free_counts[order])
            .sum()
    }

    /// Total free bytes across all zones and orders.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        (0..=MAX_ORDER)
            .map(|o| u64::from(self.free_blocks(o)) * (PAGE_SIZE << o))
            .sum()
    }

    fn desc_mut(&mut self, zi: usize, local: u32) -> &mut BlockDesc {
        &mut self.descs[(self.zones[zi].desc_offset + local) as usize]
    }

    fn insert_free(&mut self, zi: usize, local: u32, order: usize) {
        let head = self.zones[zi].free_heads[order];
        {
            let d = self.desc_mut(zi, local);
            d.state = BlockState::Free;
            d.order = order as u8;
            d.next = head;
            d.prev = NIL;
        }
        if head != NIL {
            self.desc_mut(zi, head).prev = local;
        }
        self.zones[zi].free_heads[order] = local;
        self.zones[zi].free_counts[order] += 1;
    }

    fn remove_free(&mut self, zi: usize, local: u32, order: usize) {
        let d = *self.desc_mut(zi, local);
        if d.prev == NIL {
            self.zones[zi].free_heads[order] = d.next;
        } else {
            self.desc_mut(zi, d.prev).next = d.next;
        }
        if d.next != NIL {
            self.desc_mut(zi, d.next).prev = d.prev;
        }
        let dm = self.desc_mut(zi, local);
        dm.next = NIL;
        dm.prev = NIL;
        self.zones[zi].free_counts[order] -= 1;
    }
}
