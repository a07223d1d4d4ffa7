//! # Kernel Synchronization Primitives
//!
//! A spin lock and an interrupt guard, combined as [`SpinLock::lock_irq`].
//!
//! The allocators themselves carry no locking; the exported memory surface
//! in `kernel-boot` serializes every entry point through one
//! interrupt-masking lock so an interrupt handler can never observe a
//! half-updated free list.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
