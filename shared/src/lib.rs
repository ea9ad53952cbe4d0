//! Shared types and models for the stock ledger
//!
//! Domain records, query shapes, and pure rule checks shared between the
//! ledger backend and any caller embedding it. Nothing here performs I/O.

pub mod models;
pub mod types;
pub mod validation;

pub use models::*;
pub use types::*;
pub use validation::*;
