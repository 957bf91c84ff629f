pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod io;
pub mod lock;
pub mod logging;
pub mod storage;

pub use application::{BalanceError, BalanceService, Receipt, ServiceSettings};
pub use domain::*;
pub use storage::{LedgerStore, Repository};
