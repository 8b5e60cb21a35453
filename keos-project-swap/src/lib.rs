//! # Demand paging and swap
//!
//! This crate implements a swap subsystem for KeOS: a fixed-size slot
//! table backing a disk region, synchronous page-granular I/O against that
//! region, a two-pass clock victim selector, and an adaptive replacement
//! controller that decides when and how much to swap out under memory
//! pressure.
//!
//! ## Project Outline
//!
//! - [`slot`]: the swap slot table — allocation, release and fork-time
//!   duplication of backing-store slots.
//! - [`page_io`]: synchronous 4 KiB page reads/writes against the swap
//!   device.
//! - [`pte`]: page-table-entry encoding for the present / absent / swapped
//!   states, and TLB invalidation on eviction.
//! - [`process`]: the process table the controller and victim selector
//!   consult for per-process resident set size and page-table roots.
//! - [`victim`]: victim process and victim page selection.
//! - [`controller`]: the replacement controller tying the above together —
//!   `maybe_swap`, eviction, fault-in, fork and exit hooks.
//! - [`config`]: build-time tunables for the controller.
//!
//! [`Process`]: process::Process

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod config;
pub mod controller;
pub mod page_io;
pub mod process;
pub mod pte;
pub mod slot;
pub mod victim;

pub use controller::{maybe_swap, on_fork, swap_free, swap_out, swap_page_in, swap_page_out};
pub use process::{Pid, Process, ProcessState, ProcessTable, ProcessTask};

/// Brings the slot table online. Call once during kernel bring-up, before
/// any page is swapped out.
pub fn init() {
    slot::init();
    keos::info!(
        "swap: {} slots of 4096 bytes available on device 0, starting at block {}",
        slot::NSLOTS,
        slot::BASE
    );
}
