//! # Kernel Configuration Constants
//!
//! Compile-time memory-layout and capacity constants shared by the memory
//! engine. Everything here is a `const`; runtime configuration arrives only
//! through the firmware memory map consumed by `kernel-boot`.

#![cfg_attr(not(test), no_std)]

pub mod memory;
