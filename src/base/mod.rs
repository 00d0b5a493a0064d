pub mod bus;
pub mod lock;
