#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod chunk;
pub mod config;
pub mod driver;
pub mod patterns;
pub mod pmem;
pub mod report;
pub mod sync;
pub mod system;
pub mod testword;
pub mod ui;
pub mod window;

#[cfg(test)] mod sim;

pub use driver::{Engine, EngineError, LoadSite, RunExit};
pub use testword::Testword;
