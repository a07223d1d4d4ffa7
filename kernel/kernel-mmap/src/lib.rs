//! # Physical Memory Discovery
//!
//! Everything the kernel knows about physical memory before any allocator
//! runs:
//!
//! - [`MemoryMap`]: the normalized firmware region list (base, length, kind).
//! - [`ReservationRegistry`]: physical ranges that must never be handed out
//!   by a general allocator (allocator metadata, framebuffer, firmware
//!   tables, APIC MMIO).
//! - [`DirectMap`]: turns physical addresses into dereferenceable kernel
//!   pointers via the firmware direct map, the kernel image mapping, or the
//!   boot identity map.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod direct_map;
mod map;
mod reservations;

pub use direct_map::DirectMap;
pub use map::{MemoryMap, MemoryMapEntry, RegionKind};
pub use reservations::{
    ResFlags, Reservation, ReservationKind, ReservationRegistry, RegistryError,
};
