//! Core types and primitives for the Tauon kernel.
//!
//! This crate contains the host-testable foundations the memory-management
//! crate builds on: typed physical/virtual addresses, page-size and
//! page-table-entry abstractions, spin locks, and the kernel logging
//! macros.
//!
//! By living outside the kernel binary, these types can be tested with
//! `cargo test` on the host without a kernel target.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod log;
pub mod paging;
pub mod sync;
