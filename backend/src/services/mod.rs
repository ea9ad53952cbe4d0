//! Ledger services: allocation, validation, projection and the facade over them

pub mod allocator;
pub mod ledger;
pub mod projector;
pub mod validator;

pub use allocator::{Candidate, LotAllocator};
pub use ledger::{
    AdjustInput, IssueInput, LedgerService, ReceiveInput, ReserveInput, TransferInput,
    TransferOutcome,
};
pub use projector::{BalanceDrift, BalanceProjector, RebuildReport};
pub use validator::MovementValidator;
