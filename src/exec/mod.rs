//! Execution module - typed commands and the engine that runs them

pub mod command;
mod eval;
mod executor;
mod merge;
mod select;
mod window;

pub use eval::ColumnLabel;
pub use executor::{ExecOutcome, ExecutionEngine, ResultSet};
