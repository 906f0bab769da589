//! LEONcore — the core of a real-time kernel for radiation-hardened
//! LEON3/LEON4 (SPARC v8) flight-computer platforms.
//!
//! This crate implements the nine layers that are mutually indispensable in
//! such a kernel: a two-stage memory manager (buddy pool -> page map ->
//! kmalloc), an SRMMU address-translation layer, a multi-policy scheduler
//! (EDF + round-robin) driven by a tick device, an IRQ dispatcher, a
//! SpaceWire (GRSPW2-style) descriptor-ring driver, a processing-network
//! pipeline, and an ELF application/module loader.
//!
//! Board bring-up, concrete register maps, the sysctl observer tree, and
//! `printk` console glue are out of scope (see spec.md §1) and are
//! represented here only by the narrow trait boundaries the core calls into.
//!
//! On a hosted target (anything other than `target_os = "none"`, i.e. not a
//! real bare-metal build) the crate links the system allocator so that the
//! entire test suite runs under a normal `cargo test`.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod irq;
pub mod log_service;
pub mod mm;
pub mod pnet;
pub mod raii;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod utils;

pub use error::{KernelError, KernelResult};
pub use mm::PAGE_SIZE;

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(all(target_os = "none", feature = "alloc"))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
