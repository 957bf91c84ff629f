mod entry;
mod ledger;
mod money;

pub use entry::*;
pub use ledger::*;
pub use money::*;
