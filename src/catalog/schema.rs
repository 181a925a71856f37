//! Schema definitions for ChalkDB
//!
//! This module defines table, view, trigger and index metadata.

use super::types::DataType;
use crate::exec::command::SelectCommand;
use crate::storage::Value;
use crate::trigger::TriggerProcedure;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Column definition in a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Column position (0-indexed)
    pub position: usize,
    /// Is this column nullable?
    pub nullable: bool,
    /// Default value applied when an insert omits the column
    pub default: Option<Value>,
    /// Is this part of the primary key?
    pub primary_key: bool,
    /// Is this column unique?
    pub unique: bool,
}

impl Column {
    /// Create a new column with minimal required fields
    pub fn new(name: impl Into<String>, data_type: DataType, position: usize) -> Self {
        Self {
            name: name.into(),
            data_type,
            position,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set default value
    pub fn default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Set primary key flag
    pub fn primary_key(mut self, pk: bool) -> Self {
        self.primary_key = pk;
        if pk {
            self.nullable = false;
        }
        self
    }

    /// Set unique flag
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// Table schema - defines the structure of a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered list of columns
    columns: Vec<Column>,
    /// Column name to index mapping
    name_to_index: HashMap<String, usize>,
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            name_to_index: HashMap::new(),
        }
    }

    /// Create a schema from a list of columns
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let mut schema = Self::new();
        for col in columns {
            schema.add_column(col);
        }
        schema
    }

    /// Add a column to the schema
    pub fn add_column(&mut self, mut column: Column) {
        column.position = self.columns.len();
        self.name_to_index
            .insert(column.name.clone(), column.position);
        self.columns.push(column);
    }

    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.name_to_index.get(name).map(|&idx| &self.columns[idx])
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all columns
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Get number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Check if column exists
    pub fn has_column(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Get primary key column positions, in declaration order
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.position)
            .collect()
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

/// Foreign-key constraint: local columns must reference an existing primary
/// key in the target table, or be null. Checked at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Constraint name, surfaced in constraint-violation errors
    pub name: String,
    /// Referencing columns in declaration order
    pub columns: Vec<String>,
    /// Referenced table
    pub ref_table: String,
    /// Referenced primary-key columns
    pub ref_columns: Vec<String>,
}

/// Table definition - full table metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name
    pub name: String,
    /// Table schema
    pub schema: Schema,
    /// Table ID (for internal use)
    pub id: u32,
    /// Declared foreign keys
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    /// Create a new table definition
    pub fn new(name: impl Into<String>, schema: Schema, id: u32) -> Self {
        Self {
            name: name.into(),
            schema,
            id,
            foreign_keys: Vec::new(),
        }
    }

    /// Get the table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the table schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.schema.get_column(name)
    }

    /// Whether the table declares a primary key
    pub fn has_primary_key(&self) -> bool {
        !self.schema.primary_key_positions().is_empty()
    }
}

/// Index definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Table this index belongs to
    pub table_name: String,
    /// Columns included in the index
    pub columns: Vec<String>,
    /// Is this a unique index?
    pub unique: bool,
    /// Index ID
    pub id: u32,
}

impl IndexDef {
    /// Create a new index definition
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<String>,
        id: u32,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            columns,
            unique: false,
            id,
        }
    }

    /// Set unique flag
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }
}

/// View definition: a named, stored query. Immutable once defined; views are
/// changed by dropping and recreating them.
#[derive(Debug, Clone)]
pub struct ViewDef {
    /// View name
    pub name: String,
    /// Stored query, re-evaluated on each read unless materialized
    pub query: Arc<SelectCommand>,
    /// Materialized views keep a cached row set invalidated on base mutation
    pub materialized: bool,
}

impl ViewDef {
    /// Create a new view definition
    pub fn new(name: impl Into<String>, query: SelectCommand, materialized: bool) -> Self {
        Self {
            name: name.into(),
            query: Arc::new(query),
            materialized,
        }
    }
}

/// Mutation event a trigger is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerEvent::Insert => write!(f, "INSERT"),
            TriggerEvent::Update => write!(f, "UPDATE"),
            TriggerEvent::Delete => write!(f, "DELETE"),
        }
    }
}

/// Whether a trigger fires before or after the change is staged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerTiming {
    Before,
    After,
}

/// Trigger definition: bound to one table, one event and one timing, holding
/// the procedure the dispatcher invokes
#[derive(Clone)]
pub struct TriggerDef {
    /// Trigger name
    pub name: String,
    /// Table the trigger is bound to
    pub table_name: String,
    /// Mutation event
    pub event: TriggerEvent,
    /// BEFORE or AFTER
    pub timing: TriggerTiming,
    /// The procedure to invoke; never called directly, only via the dispatcher
    pub procedure: Arc<dyn TriggerProcedure>,
}

impl TriggerDef {
    /// Create a new trigger definition
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        event: TriggerEvent,
        timing: TriggerTiming,
        procedure: Arc<dyn TriggerProcedure>,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            event,
            timing,
            procedure,
        }
    }
}

impl fmt::Debug for TriggerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerDef")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .field("event", &self.event)
            .field("timing", &self.timing)
            .finish()
    }
}
