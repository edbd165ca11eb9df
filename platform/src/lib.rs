#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod cache;
pub mod heap;
pub mod hwctrl;
pub mod interrupt;
pub mod memctrl;
pub mod memrw;
pub mod shim;
pub mod smp;
pub mod system;
pub mod vmem;

pub use shim::{ap_main, firmware_main, BootInfo};
pub use system::X86System;
