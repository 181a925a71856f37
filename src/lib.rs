//! ChalkDB - an embedded SQL execution sandbox for teaching
//!
//! This library provides a small relational engine meant to be driven
//! programmatically:
//! - System catalog (tables, views, triggers, indexes) with versioned
//!   snapshots
//! - In-memory storage engine with snapshot reads and write intents
//! - Execution engine for typed commands (joins, grouping, window
//!   functions, MERGE)
//! - Transactions with snapshot isolation, statement atomicity and
//!   commit-time integrity validation
//! - BEFORE/AFTER triggers with veto and bounded recursion

pub mod catalog;
pub mod error;
pub mod exec;
pub mod sandbox;
pub mod storage;
pub mod transaction;
pub mod trigger;

pub use error::{Error, Result};
pub use sandbox::Sandbox;
