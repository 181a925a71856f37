//! Catalog module - versioned metadata for tables, views, triggers and indexes

mod catalog;
mod schema;
mod types;

pub use catalog::{Catalog, CatalogObject, CatalogSnapshot, TableBuilder};
pub use schema::{
    Column, ForeignKeyDef, IndexDef, Schema, TableDef, TriggerDef, TriggerEvent, TriggerTiming,
    ViewDef,
};
pub use types::DataType;
