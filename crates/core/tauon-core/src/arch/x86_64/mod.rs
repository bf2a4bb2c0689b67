//! x86_64 implementations of the core capabilities.

pub mod paging;
