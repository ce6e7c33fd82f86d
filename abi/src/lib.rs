//! Opal kernel-userland ABI types.
//!
//! Canonical definitions for the types that cross the kernel boundary. A
//! single source of truth keeps the kernel and userland layouts in lockstep;
//! everything here is `#[repr(C)]` or `#[repr(transparent)]` for ABI
//! stability.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod net;
