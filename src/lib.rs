//! Lane and row repair engine for HBM stacks reached through the memory's
//! wrapper test port.

pub mod base;
pub mod error;
pub mod hbm;
pub mod mbist;
pub mod repair;
pub mod sim;
pub mod utils;
pub mod wir;

#[cfg(test)]
mod unit_tests;

pub use error::{DecodeError, RepairError, RepairResult};
pub use repair::RepairOrchestrator;
