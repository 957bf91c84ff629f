// Application layer: the deposit/withdraw critical sections and their errors.
// Transports (the CLI here) call into BalanceService and nothing below it.

pub mod error;
pub mod service;

pub use error::*;
pub use service::*;
