pub mod account;
pub mod entry_input;
pub mod ledger_entry;

pub use account::LedgerAccount;
pub use entry_input::EntryInput;
pub use ledger_entry::{
    chain_instant, sort_chain, ChainKey, EntryDirection, LedgerEntry, AMOUNT_LIMIT, MAX_AMOUNT_SCALE,
};
