//! Transaction module - lifecycle, working sets and commit validation

mod transaction;

pub use transaction::{RowChange, Transaction, TransactionManager, TransactionState};
