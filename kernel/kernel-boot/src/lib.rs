//! # Memory Bootstrap and Surface
//!
//! The orchestrator that turns a firmware memory map into a running memory
//! engine, and the single surface the rest of the kernel calls.
//!
//! [`MemoryContext::init`] solves the chicken-and-egg problem (allocator
//! descriptors need memory before any allocator exists) by carving the
//! descriptor storage out of the largest usable region and registering it
//! as a reservation *before* either allocator ingests the map. It then
//! brings up the frame allocator, the buddy zones, the kernel address
//! space (with self-verification), the heap and the process VM manager in
//! dependency order.
//!
//! [`KernelMemory`] wraps the context in an interrupt-safe spin lock and
//! exports the operation set the scheduler and drivers are permitted to
//! use; everything below it stays crate-private to the engine.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod context;
mod global_alloc;
mod surface;

pub use context::{BootError, BootInfo, MemoryContext};
pub use global_alloc::KernelAllocator;
pub use surface::KernelMemory;
