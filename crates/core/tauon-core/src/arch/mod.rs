//! Architecture-specific implementations of the core capabilities.

pub mod x86_64;
