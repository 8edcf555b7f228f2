//! Constants that configure the Cascade kernel's memory subsystem.
//!
//! Everything here is a plain `pub const` so that other crates can use these
//! values in const contexts, e.g., for sizing static arrays.

#![no_std]

pub mod memory;
