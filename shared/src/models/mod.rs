//! Domain models for the stock ledger

mod balance;
mod batch;
mod movement;
mod reservation;

pub use balance::*;
pub use batch::*;
pub use movement::*;
pub use reservation::*;
