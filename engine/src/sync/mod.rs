//! Synchronisation primitives used when running tests across cores.

pub mod barrier;

pub use barrier::Barrier;
