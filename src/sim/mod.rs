pub mod bus;
pub mod config;
pub mod stack;

pub use bus::{BusAccess, SimBus};
pub use stack::SimulatedStack;
