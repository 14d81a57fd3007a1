//! Compile-time configuration of the kernel core.
//!
//! Values are plain constants grouped by concern.
//! Build-time switches are Cargo features of this crate,
//! which other crates observe through the boolean constants below
//! rather than through their own `cfg`s.

#![no_std]

extern crate cfg_if;

pub mod memory;
pub mod sched;
pub mod time;
