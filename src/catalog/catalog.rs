//! System Catalog for ChalkDB
//!
//! The catalog manages metadata for tables, views, triggers and indexes.
//! Every structural change publishes a new immutable snapshot with a bumped
//! version; in-flight transactions keep resolving names against the snapshot
//! they captured at begin, so DDL never shifts schema under a running
//! statement.

use super::schema::{
    Column, ForeignKeyDef, IndexDef, Schema, TableDef, TriggerDef, TriggerEvent, TriggerTiming,
    ViewDef,
};
use super::types::DataType;
use crate::error::{Error, Result};
use crate::exec::command::SelectCommand;
use crate::storage::Value;
use crate::trigger::TriggerProcedure;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// A resolved catalog object
#[derive(Debug, Clone)]
pub enum CatalogObject {
    Table(Arc<TableDef>),
    View(Arc<ViewDef>),
}

/// An immutable view of all definitions as of one catalog version
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    /// Snapshot version, bumped on every structural change
    version: u64,
    /// Table definitions by name
    tables: HashMap<String, Arc<TableDef>>,
    /// View definitions by name
    views: HashMap<String, Arc<ViewDef>>,
    /// Trigger definitions in registration order
    triggers: IndexMap<String, Arc<TriggerDef>>,
    /// Index definitions by name
    indexes: HashMap<String, Arc<IndexDef>>,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            tables: HashMap::new(),
            views: HashMap::new(),
            triggers: IndexMap::new(),
            indexes: HashMap::new(),
        }
    }

    /// Snapshot version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get a table by name
    pub fn get_table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Get a view by name
    pub fn get_view(&self, name: &str) -> Result<Arc<ViewDef>> {
        self.views
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ViewNotFound(name.to_string()))
    }

    /// Resolve a name to a table or view
    pub fn resolve(&self, name: &str) -> Result<CatalogObject> {
        if let Some(table) = self.tables.get(name) {
            return Ok(CatalogObject::Table(table.clone()));
        }
        if let Some(view) = self.views.get(name) {
            return Ok(CatalogObject::View(view.clone()));
        }
        Err(Error::ObjectNotFound(name.to_string()))
    }

    /// Check if a table exists
    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// List all table names
    pub fn list_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Triggers matching (table, event, timing), in registration order
    pub fn triggers_for(
        &self,
        table: &str,
        event: TriggerEvent,
        timing: TriggerTiming,
    ) -> Vec<Arc<TriggerDef>> {
        self.triggers
            .values()
            .filter(|t| t.table_name == table && t.event == event && t.timing == timing)
            .cloned()
            .collect()
    }

    /// All indexes declared on a table
    pub fn indexes_for(&self, table: &str) -> Vec<Arc<IndexDef>> {
        self.indexes
            .values()
            .filter(|idx| idx.table_name == table)
            .cloned()
            .collect()
    }

    /// Get an index by name
    pub fn get_index(&self, name: &str) -> Result<Arc<IndexDef>> {
        self.indexes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }
}

/// System Catalog - versioned container for all metadata
#[derive(Debug)]
pub struct Catalog {
    /// Current snapshot; swapped atomically on each structural change
    current: RwLock<Arc<CatalogSnapshot>>,
    /// Next table ID
    next_table_id: Mutex<u32>,
    /// Next index ID
    next_index_id: Mutex<u32>,
}

impl Catalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            next_table_id: Mutex::new(1),
            next_index_id: Mutex::new(1),
        }
    }

    /// Capture the current snapshot
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().unwrap().clone()
    }

    /// Apply a structural change, publishing a new snapshot
    fn publish<F>(&self, mutate: F) -> Result<Arc<CatalogSnapshot>>
    where
        F: FnOnce(&mut CatalogSnapshot) -> Result<()>,
    {
        let mut current = self.current.write().unwrap();
        let mut next = (**current).clone();
        mutate(&mut next)?;
        next.version += 1;
        let next = Arc::new(next);
        *current = next.clone();
        Ok(next)
    }

    /// Define a new table
    pub fn define_table(
        &self,
        name: &str,
        schema: Schema,
        foreign_keys: Vec<ForeignKeyDef>,
    ) -> Result<Arc<TableDef>> {
        let id = {
            let mut next_id = self.next_table_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let mut created = None;
        self.publish(|snap| {
            if snap.tables.contains_key(name) || snap.views.contains_key(name) {
                return Err(Error::TableAlreadyExists(name.to_string()));
            }
            for fk in &foreign_keys {
                let target = snap
                    .tables
                    .get(&fk.ref_table)
                    .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?;
                for col in &fk.columns {
                    if schema.get_column_index(col).is_none() {
                        return Err(Error::ColumnNotFound(col.clone(), name.to_string()));
                    }
                }
                // Commit-time validation probes the target's primary-key map
                // with the referencing values, so the reference must be the
                // target's full primary key in declaration order.
                let target_pk: Vec<&str> = target
                    .schema()
                    .primary_key_positions()
                    .into_iter()
                    .map(|pos| target.schema().columns()[pos].name.as_str())
                    .collect();
                let matches_pk = !target_pk.is_empty()
                    && fk.ref_columns.len() == target_pk.len()
                    && fk.columns.len() == fk.ref_columns.len()
                    && fk.ref_columns.iter().map(String::as_str).eq(target_pk);
                if !matches_pk {
                    return Err(Error::InvalidForeignKey(
                        fk.name.clone(),
                        fk.ref_table.clone(),
                    ));
                }
            }
            let mut def = TableDef::new(name, schema, id);
            def.foreign_keys = foreign_keys;
            let def = Arc::new(def);
            created = Some(def.clone());
            snap.tables.insert(name.to_string(), def);
            Ok(())
        })?;

        debug!(table = name, "table defined");
        Ok(created.expect("publish succeeded"))
    }

    /// Drop a table, along with its triggers and indexes
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.publish(|snap| {
            if snap.tables.remove(name).is_none() {
                return Err(Error::TableNotFound(name.to_string()));
            }
            snap.triggers.retain(|_, t| t.table_name != name);
            snap.indexes.retain(|_, idx| idx.table_name != name);
            Ok(())
        })?;
        debug!(table = name, "table dropped");
        Ok(())
    }

    /// Define a new view over a stored query
    pub fn define_view(
        &self,
        name: &str,
        query: SelectCommand,
        materialized: bool,
    ) -> Result<Arc<ViewDef>> {
        let mut created = None;
        self.publish(|snap| {
            if snap.views.contains_key(name) || snap.tables.contains_key(name) {
                return Err(Error::ViewAlreadyExists(name.to_string()));
            }
            let def = Arc::new(ViewDef::new(name, query, materialized));
            created = Some(def.clone());
            snap.views.insert(name.to_string(), def);
            Ok(())
        })?;
        debug!(view = name, materialized, "view defined");
        Ok(created.expect("publish succeeded"))
    }

    /// Drop a view
    pub fn drop_view(&self, name: &str) -> Result<()> {
        self.publish(|snap| {
            if snap.views.remove(name).is_none() {
                return Err(Error::ViewNotFound(name.to_string()));
            }
            Ok(())
        })?;
        debug!(view = name, "view dropped");
        Ok(())
    }

    /// Define a new trigger on a table
    pub fn define_trigger(
        &self,
        name: &str,
        table_name: &str,
        event: TriggerEvent,
        timing: TriggerTiming,
        procedure: Arc<dyn TriggerProcedure>,
    ) -> Result<Arc<TriggerDef>> {
        let mut created = None;
        self.publish(|snap| {
            if !snap.tables.contains_key(table_name) {
                return Err(Error::TableNotFound(table_name.to_string()));
            }
            if snap.triggers.contains_key(name) {
                return Err(Error::TriggerAlreadyExists(name.to_string()));
            }
            let def = Arc::new(TriggerDef::new(name, table_name, event, timing, procedure));
            created = Some(def.clone());
            snap.triggers.insert(name.to_string(), def);
            Ok(())
        })?;
        debug!(trigger = name, table = table_name, "trigger defined");
        Ok(created.expect("publish succeeded"))
    }

    /// Drop a trigger
    pub fn drop_trigger(&self, name: &str) -> Result<()> {
        self.publish(|snap| {
            if snap.triggers.shift_remove(name).is_none() {
                return Err(Error::TriggerNotFound(name.to_string()));
            }
            Ok(())
        })?;
        debug!(trigger = name, "trigger dropped");
        Ok(())
    }

    /// Define a secondary index
    pub fn define_index(
        &self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
        unique: bool,
    ) -> Result<Arc<IndexDef>> {
        let id = {
            let mut next_id = self.next_index_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let mut created = None;
        self.publish(|snap| {
            let table = snap
                .tables
                .get(table_name)
                .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;
            for col_name in &columns {
                if table.get_column(col_name).is_none() {
                    return Err(Error::ColumnNotFound(
                        col_name.clone(),
                        table_name.to_string(),
                    ));
                }
            }
            if snap.indexes.contains_key(name) {
                return Err(Error::IndexAlreadyExists(name.to_string()));
            }
            let def = Arc::new(IndexDef::new(name, table_name, columns, id).unique(unique));
            created = Some(def.clone());
            snap.indexes.insert(name.to_string(), def);
            Ok(())
        })?;
        debug!(index = name, table = table_name, "index defined");
        Ok(created.expect("publish succeeded"))
    }

    /// Drop an index
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.publish(|snap| {
            if snap.indexes.remove(name).is_none() {
                return Err(Error::IndexNotFound(name.to_string()));
            }
            Ok(())
        })?;
        debug!(index = name, "index dropped");
        Ok(())
    }

    /// Save table and index definitions to disk as JSON. Views and triggers
    /// are runtime registrations and are not persisted.
    pub fn save_to_disk(&self, path: &str) -> Result<()> {
        let snap = self.snapshot();
        let data = CatalogData {
            tables: snap.tables.values().map(|t| (**t).clone()).collect(),
            indexes: snap.indexes.values().map(|i| (**i).clone()).collect(),
            next_table_id: *self.next_table_id.lock().unwrap(),
            next_index_id: *self.next_index_id.lock().unwrap(),
        };

        let json =
            serde_json::to_string_pretty(&data).map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(path, json).map_err(Error::IoError)?;
        Ok(())
    }

    /// Load table and index definitions from disk
    pub fn load_from_disk(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(Error::IoError)?;
        let data: CatalogData =
            serde_json::from_str(&json).map_err(|e| Error::Internal(e.to_string()))?;

        let mut snap = CatalogSnapshot::empty();
        for table in data.tables {
            snap.tables.insert(table.name.clone(), Arc::new(table));
        }
        for index in data.indexes {
            snap.indexes.insert(index.name.clone(), Arc::new(index));
        }
        snap.version = 1;

        Ok(Self {
            current: RwLock::new(Arc::new(snap)),
            next_table_id: Mutex::new(data.next_table_id),
            next_index_id: Mutex::new(data.next_index_id),
        })
    }
}

/// Serializable proxy for Catalog
#[derive(serde::Serialize, serde::Deserialize)]
struct CatalogData {
    tables: Vec<TableDef>,
    indexes: Vec<IndexDef>,
    next_table_id: u32,
    next_index_id: u32,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for defining tables with a fluent API
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl TableBuilder {
    /// Start building a new table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a column
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let position = self.columns.len();
        self.columns.push(Column::new(name, data_type, position));
        self
    }

    /// Add a primary key column (INTEGER PRIMARY KEY)
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let position = self.columns.len();
        self.columns
            .push(Column::new(name, DataType::Integer, position).primary_key(true));
        self
    }

    /// Add a NOT NULL column
    pub fn column_not_null(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let position = self.columns.len();
        self.columns
            .push(Column::new(name, data_type, position).nullable(false));
        self
    }

    /// Add a column with a default value
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: Value,
    ) -> Self {
        let position = self.columns.len();
        self.columns
            .push(Column::new(name, data_type, position).default(default));
        self
    }

    /// Add a foreign-key constraint
    pub fn foreign_key(
        mut self,
        name: impl Into<String>,
        columns: Vec<&str>,
        ref_table: impl Into<String>,
        ref_columns: Vec<&str>,
    ) -> Self {
        self.foreign_keys.push(ForeignKeyDef {
            name: name.into(),
            columns: columns.into_iter().map(String::from).collect(),
            ref_table: ref_table.into(),
            ref_columns: ref_columns.into_iter().map(String::from).collect(),
        });
        self
    }

    /// Define the table in the catalog
    pub fn build(self, catalog: &Catalog) -> Result<Arc<TableDef>> {
        let schema = Schema::from_columns(self.columns);
        catalog.define_table(&self.name, schema, self.foreign_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_resolve_table() {
        let catalog = Catalog::new();

        let mut schema = Schema::new();
        schema.add_column(Column::new("id", DataType::Integer, 0).primary_key(true));
        schema.add_column(Column::new("name", DataType::Varchar(100), 1));

        let table = catalog.define_table("users", schema, Vec::new()).unwrap();
        assert_eq!(table.name(), "users");

        let snap = catalog.snapshot();
        assert!(matches!(
            snap.resolve("users").unwrap(),
            CatalogObject::Table(_)
        ));
        assert!(matches!(
            snap.resolve("missing"),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_foreign_key_must_reference_primary_key() {
        let catalog = Catalog::new();
        TableBuilder::new("accounts")
            .primary_key("id")
            .column("email", DataType::Text)
            .build(&catalog)
            .unwrap();

        // A non-primary-key target column is rejected at definition
        let result = TableBuilder::new("transfers")
            .primary_key("id")
            .column("account_email", DataType::Text)
            .foreign_key("fk_email", vec!["account_email"], "accounts", vec!["email"])
            .build(&catalog);
        assert!(matches!(result, Err(Error::InvalidForeignKey(_, _))));

        // So is a table with no primary key at all
        TableBuilder::new("log")
            .column("note", DataType::Text)
            .build(&catalog)
            .unwrap();
        let result = TableBuilder::new("pointers")
            .primary_key("id")
            .column("note", DataType::Text)
            .foreign_key("fk_note", vec!["note"], "log", vec!["note"])
            .build(&catalog);
        assert!(matches!(result, Err(Error::InvalidForeignKey(_, _))));

        // A missing referencing column is a column error
        let result = TableBuilder::new("transfers")
            .primary_key("id")
            .foreign_key("fk_account", vec!["account_id"], "accounts", vec!["id"])
            .build(&catalog);
        assert!(matches!(result, Err(Error::ColumnNotFound(_, _))));

        // The full primary key in declaration order is accepted
        TableBuilder::new("transfers")
            .primary_key("id")
            .column("account_id", DataType::Integer)
            .foreign_key("fk_account", vec!["account_id"], "accounts", vec!["id"])
            .build(&catalog)
            .unwrap();
    }

    #[test]
    fn test_duplicate_definition_conflicts() {
        let catalog = Catalog::new();

        catalog
            .define_table("test", Schema::new(), Vec::new())
            .unwrap();
        let result = catalog.define_table("test", Schema::new(), Vec::new());
        assert!(matches!(result, Err(Error::TableAlreadyExists(_))));
    }

    #[test]
    fn test_snapshot_isolation_of_ddl() {
        let catalog = Catalog::new();
        catalog
            .define_table("early", Schema::new(), Vec::new())
            .unwrap();

        let before = catalog.snapshot();
        catalog
            .define_table("late", Schema::new(), Vec::new())
            .unwrap();

        // The earlier snapshot does not see the later table
        assert!(!before.table_exists("late"));
        assert!(catalog.snapshot().table_exists("late"));
        assert!(catalog.snapshot().version() > before.version());
    }

    #[test]
    fn test_drop_table_drops_dependents() {
        let catalog = Catalog::new();
        TableBuilder::new("orders")
            .primary_key("id")
            .column("total", DataType::Integer)
            .build(&catalog)
            .unwrap();
        catalog
            .define_index("idx_orders_total", "orders", vec!["total".to_string()], false)
            .unwrap();

        catalog.drop_table("orders").unwrap();
        let snap = catalog.snapshot();
        assert!(matches!(
            snap.get_index("idx_orders_total"),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_foreign_key_requires_target() {
        let catalog = Catalog::new();
        let result = TableBuilder::new("orders")
            .primary_key("id")
            .column("user_id", DataType::Integer)
            .foreign_key("fk_orders_user", vec!["user_id"], "users", vec!["id"])
            .build(&catalog);
        assert!(matches!(result, Err(Error::TableNotFound(_))));
    }
}
