//! Storage module - in-memory row store with snapshots and write intents

mod engine;
mod row;
mod table;

pub use engine::{DataSnapshot, RowScan, ScanPredicate, StorageEngine};
pub use row::{IndexKey, Row, RowKey, Value};
pub use table::{SecondaryIndex, TableData};
