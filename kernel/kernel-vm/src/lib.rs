//! # Process Virtual Memory
//!
//! One [`ProcessVm`] per task: a page-table root whose kernel half mirrors
//! the kernel's, plus a bounded list of [`Vma`]s describing what the lower
//! half may contain. The [`VmManager`] owns the process table (pid = slot
//! index), creates and destroys address spaces with rollback, grows
//! process heaps, and resolves page faults by lazy page-in.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod manager;
mod vma;

pub use manager::{Pid, ProcessVm, VmError, VmManager};
pub use vma::{Vma, VmaKind, VmaPerms};
