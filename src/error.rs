//! Error types for ChalkDB
//!
//! This module defines all error types used throughout the sandbox.

use thiserror::Error;

use crate::storage::RowKey;

/// The main error type for ChalkDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Catalog Errors ==========
    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Catalog error: column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Catalog error: view '{0}' not found")]
    ViewNotFound(String),

    #[error("Catalog error: view '{0}' already exists")]
    ViewAlreadyExists(String),

    #[error("Catalog error: trigger '{0}' not found")]
    TriggerNotFound(String),

    #[error("Catalog error: trigger '{0}' already exists")]
    TriggerAlreadyExists(String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Catalog error: object '{0}' not found")]
    ObjectNotFound(String),

    #[error("Catalog error: foreign key '{0}' must reference the primary key of table '{1}'")]
    InvalidForeignKey(String, String),

    // ========== Type Errors ==========
    #[error("Type error: cannot convert {from} to {to}")]
    TypeMismatch { from: String, to: String },

    #[error("Type error: null value not allowed for column '{0}'")]
    NullNotAllowed(String),

    // ========== Integrity Errors ==========
    #[error("Integrity error: duplicate key {key} in table '{table}'")]
    DuplicateKey { table: String, key: RowKey },

    #[error("Integrity error: constraint '{constraint}' violated on table '{table}' for key {key}")]
    ConstraintViolation {
        constraint: String,
        table: String,
        key: RowKey,
    },

    // ========== Concurrency Errors ==========
    #[error("Write conflict on key {key} in table '{table}': {reason}")]
    WriteConflict {
        table: String,
        key: RowKey,
        reason: String,
    },

    // ========== Trigger Errors ==========
    #[error("Trigger '{trigger}' vetoed {event} on table '{table}': {reason}")]
    Veto {
        trigger: String,
        table: String,
        event: String,
        reason: String,
    },

    #[error("Trigger recursion limit ({0}) exceeded")]
    TriggerRecursion(usize),

    // ========== Transaction Errors ==========
    #[error("Transaction error: transaction {0} already reached a terminal state")]
    TransactionFinished(u64),

    // ========== Execution Errors ==========
    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Execution error: division by zero")]
    DivisionByZero,

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for ChalkDB operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;

    #[test]
    fn test_error_display() {
        let err = Error::TableNotFound("students".to_string());
        assert_eq!(err.to_string(), "Catalog error: table 'students' not found");

        let err = Error::DuplicateKey {
            table: "students".to_string(),
            key: RowKey::from_values(vec![Value::Integer(1)]),
        };
        assert!(err.to_string().contains("duplicate key"));
        assert!(err.to_string().contains("students"));
    }
}
