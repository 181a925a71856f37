//! Execution Engine
//!
//! Executes typed commands against one transaction at a time. Every
//! statement runs atomically: a trigger veto or mid-statement failure
//! rewinds exactly that statement's staged changes and leaves the
//! transaction ACTIVE, while blowing the trigger recursion limit aborts
//! the whole transaction. DDL takes effect immediately in the shared
//! catalog and in the issuing transaction's snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::catalog::{Catalog, Column, Schema, TableDef, TriggerEvent};
use crate::error::{Error, Result};
use crate::exec::command::{
    Assignment, ColumnSpec, Command, DeleteCommand, InsertCommand, UpdateCommand,
};
use crate::exec::eval::{evaluate, evaluate_predicate, ColumnLabel, EvalScope};
use crate::exec::select::CachedView;
use crate::storage::{Row, RowKey, StorageEngine, Value};
use crate::transaction::Transaction;
use crate::trigger::TriggerDispatcher;

/// Rows returned by a SELECT
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    /// Output column names, in projection order
    pub columns: Vec<String>,
    /// Output rows
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// What a command produced
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// SELECT output
    Rows(ResultSet),
    /// Number of rows a mutation touched (0 for DDL)
    Affected(usize),
}

impl ExecOutcome {
    /// The result set, if the command was a query
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            ExecOutcome::Rows(rs) => Some(rs),
            ExecOutcome::Affected(_) => None,
        }
    }

    /// Affected-row count for mutations, 0 otherwise
    pub fn affected(&self) -> usize {
        match self {
            ExecOutcome::Rows(_) => 0,
            ExecOutcome::Affected(n) => *n,
        }
    }
}

/// Execution Engine - runs commands, firing triggers around mutations
pub struct ExecutionEngine {
    catalog: Arc<Catalog>,
    storage: Arc<StorageEngine>,
    dispatcher: TriggerDispatcher,
    view_cache: Mutex<HashMap<String, CachedView>>,
}

impl ExecutionEngine {
    pub fn new(catalog: Arc<Catalog>, storage: Arc<StorageEngine>) -> Self {
        Self {
            catalog,
            storage,
            dispatcher: TriggerDispatcher::new(),
            view_cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub(crate) fn view_cache(&self) -> &Mutex<HashMap<String, CachedView>> {
        &self.view_cache
    }

    /// Execute one command as an atomic statement
    pub fn execute(&self, command: &Command, txn: &mut Transaction) -> Result<ExecOutcome> {
        txn.ensure_active()?;
        txn.begin_statement();
        debug!(txn = txn.id(), ?command, "executing");

        match self.dispatch(command, txn) {
            Ok(outcome) => Ok(outcome),
            Err(err @ Error::TriggerRecursion(_)) => {
                txn.force_abort(&self.storage);
                Err(err)
            }
            Err(err) => {
                // Statement atomicity: rewind this statement's staged
                // changes, the transaction stays usable.
                txn.undo_statement(&self.storage);
                Err(err)
            }
        }
    }

    /// Execute a command issued from inside a trigger. Joins the current
    /// statement's atomic scope instead of opening its own.
    pub(crate) fn execute_nested(
        &self,
        command: &Command,
        txn: &mut Transaction,
    ) -> Result<ExecOutcome> {
        txn.ensure_active()?;
        self.dispatch(command, txn)
    }

    fn dispatch(&self, command: &Command, txn: &mut Transaction) -> Result<ExecOutcome> {
        match command {
            Command::CreateTable {
                name,
                columns,
                foreign_keys,
                if_not_exists,
            } => {
                if *if_not_exists && txn.catalog_snapshot().table_exists(name) {
                    return Ok(ExecOutcome::Affected(0));
                }
                let schema = schema_from_specs(columns);
                self.catalog.define_table(name, schema, foreign_keys.clone())?;
                let data = self.storage.create_table(name);
                txn.adopt_catalog(self.catalog.snapshot());
                txn.adopt_table(name, data);
                Ok(ExecOutcome::Affected(0))
            }

            Command::DropTable { name, if_exists } => {
                if *if_exists && !txn.catalog_snapshot().table_exists(name) {
                    return Ok(ExecOutcome::Affected(0));
                }
                self.catalog.drop_table(name)?;
                self.storage.drop_table(name);
                txn.adopt_catalog(self.catalog.snapshot());
                txn.forget_table(name);
                self.view_cache
                    .lock()
                    .unwrap()
                    .retain(|_, v| !v.deps.iter().any(|(dep, _)| dep == name));
                Ok(ExecOutcome::Affected(0))
            }

            Command::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                let def = self
                    .catalog
                    .define_index(name, table, columns.clone(), *unique)?;
                txn.adopt_catalog(self.catalog.snapshot());
                // backfill over committed rows; staged rows join at commit
                if let Some(data) = self.storage.committed_table(table) {
                    let table_def = txn.catalog_snapshot().get_table(table)?;
                    let rebuilt = data.with_index(&def, &table_def)?;
                    self.storage.replace_table(table, rebuilt);
                    if let Some(fresh) = self.storage.committed_table(table) {
                        txn.adopt_table(table, fresh);
                    }
                }
                Ok(ExecOutcome::Affected(0))
            }

            Command::DropIndex { name } => {
                let def = txn.catalog_snapshot().get_index(name)?;
                self.catalog.drop_index(name)?;
                txn.adopt_catalog(self.catalog.snapshot());
                if let Some(data) = self.storage.committed_table(&def.table_name) {
                    self.storage
                        .replace_table(&def.table_name, data.without_index(name));
                    if let Some(fresh) = self.storage.committed_table(&def.table_name) {
                        txn.adopt_table(&def.table_name, fresh);
                    }
                }
                Ok(ExecOutcome::Affected(0))
            }

            Command::CreateView {
                name,
                query,
                materialized,
            } => {
                self.catalog.define_view(name, query.clone(), *materialized)?;
                txn.adopt_catalog(self.catalog.snapshot());
                Ok(ExecOutcome::Affected(0))
            }

            Command::DropView { name } => {
                self.catalog.drop_view(name)?;
                txn.adopt_catalog(self.catalog.snapshot());
                self.view_cache.lock().unwrap().remove(name);
                Ok(ExecOutcome::Affected(0))
            }

            Command::CreateTrigger {
                name,
                table,
                event,
                timing,
                procedure,
            } => {
                self.catalog
                    .define_trigger(name, table, *event, *timing, procedure.clone())?;
                txn.adopt_catalog(self.catalog.snapshot());
                Ok(ExecOutcome::Affected(0))
            }

            Command::DropTrigger { name } => {
                self.catalog.drop_trigger(name)?;
                txn.adopt_catalog(self.catalog.snapshot());
                Ok(ExecOutcome::Affected(0))
            }

            Command::Select(select) => Ok(ExecOutcome::Rows(self.run_select(select, txn)?)),
            Command::Insert(insert) => self.run_insert(insert, txn),
            Command::Update(update) => self.run_update(update, txn),
            Command::Delete(delete) => self.run_delete(delete, txn),
            Command::Merge(merge) => Ok(ExecOutcome::Affected(self.run_merge(merge, txn)?)),
        }
    }

    fn run_insert(&self, insert: &InsertCommand, txn: &mut Transaction) -> Result<ExecOutcome> {
        let table = txn.catalog_snapshot().get_table(&insert.table)?;
        let mut count = 0;
        for exprs in &insert.rows {
            let values = exprs
                .iter()
                .map(|e| evaluate(e, &[], &[]))
                .collect::<Result<Vec<_>>>()?;
            let row = build_insert_row(&table, insert.columns.as_deref(), values)?;
            self.insert_row(&table, row, txn)?;
            count += 1;
        }
        Ok(ExecOutcome::Affected(count))
    }

    fn run_update(&self, update: &UpdateCommand, txn: &mut Transaction) -> Result<ExecOutcome> {
        let table = txn.catalog_snapshot().get_table(&update.table)?;
        let labels = table_labels(&table);

        let matches = self.matching_rows(&table, update.filter.as_ref(), &labels, txn)?;
        let mut count = 0;
        for (key, old) in matches {
            let new = apply_assignments(&table, &old, &update.assignments, &labels)?;
            self.update_row(&table, &key, &old, new, txn)?;
            count += 1;
        }
        Ok(ExecOutcome::Affected(count))
    }

    fn run_delete(&self, delete: &DeleteCommand, txn: &mut Transaction) -> Result<ExecOutcome> {
        let table = txn.catalog_snapshot().get_table(&delete.table)?;
        let labels = table_labels(&table);

        let matches = self.matching_rows(&table, delete.filter.as_ref(), &labels, txn)?;
        let mut count = 0;
        for (key, old) in matches {
            self.delete_row(&table, &key, &old, txn)?;
            count += 1;
        }
        Ok(ExecOutcome::Affected(count))
    }

    /// Materialize the rows a mutation's filter selects, before any of the
    /// mutations run
    fn matching_rows(
        &self,
        table: &TableDef,
        filter: Option<&crate::exec::command::Expr>,
        labels: &[ColumnLabel],
        txn: &Transaction,
    ) -> Result<Vec<(RowKey, Row)>> {
        let mut matches = Vec::new();
        for (key, row) in self.storage.scan(txn, table.name(), None)? {
            let keep = match filter {
                Some(expr) => {
                    evaluate_predicate(expr, row.values(), labels, EvalScope::default())?
                }
                None => true,
            };
            if keep {
                matches.push((key, row));
            }
        }
        Ok(matches)
    }

    pub(crate) fn insert_row(
        &self,
        table: &TableDef,
        row: Row,
        txn: &mut Transaction,
    ) -> Result<RowKey> {
        self.dispatcher.dispatch_before(
            self,
            txn,
            table.name(),
            TriggerEvent::Insert,
            None,
            Some(&row),
        )?;
        let key = self.storage.put(txn, table, row.clone())?;
        self.dispatcher.dispatch_after(
            self,
            txn,
            table.name(),
            TriggerEvent::Insert,
            None,
            Some(&row),
        )?;
        Ok(key)
    }

    pub(crate) fn update_row(
        &self,
        table: &TableDef,
        key: &RowKey,
        old: &Row,
        new: Row,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.dispatcher.dispatch_before(
            self,
            txn,
            table.name(),
            TriggerEvent::Update,
            Some(old),
            Some(&new),
        )?;
        let new_key = self.storage.row_key(txn, table, &new)?;
        if table.has_primary_key() && new_key != *key {
            // identity change re-keys the row
            self.storage.delete(txn, table.name(), key)?;
            self.storage.put(txn, table, new.clone())?;
        } else {
            self.storage.update(txn, table.name(), key, new.clone())?;
        }
        self.dispatcher.dispatch_after(
            self,
            txn,
            table.name(),
            TriggerEvent::Update,
            Some(old),
            Some(&new),
        )?;
        Ok(())
    }

    pub(crate) fn delete_row(
        &self,
        table: &TableDef,
        key: &RowKey,
        old: &Row,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.dispatcher.dispatch_before(
            self,
            txn,
            table.name(),
            TriggerEvent::Delete,
            Some(old),
            None,
        )?;
        self.storage.delete(txn, table.name(), key)?;
        self.dispatcher.dispatch_after(
            self,
            txn,
            table.name(),
            TriggerEvent::Delete,
            Some(old),
            None,
        )?;
        Ok(())
    }
}

fn schema_from_specs(specs: &[ColumnSpec]) -> Schema {
    let mut schema = Schema::new();
    for spec in specs {
        let mut column = Column::new(spec.name.clone(), spec.data_type.clone(), 0)
            .nullable(!spec.not_null)
            .primary_key(spec.primary_key)
            .unique(spec.unique);
        if let Some(default) = &spec.default {
            column = column.default(default.clone());
        }
        schema.add_column(column);
    }
    schema
}

fn table_labels(table: &TableDef) -> Vec<ColumnLabel> {
    table
        .schema()
        .columns()
        .iter()
        .map(|c| ColumnLabel::new(Some(table.name().to_string()), c.name.clone()))
        .collect()
}

fn apply_assignments(
    table: &TableDef,
    old: &Row,
    assignments: &[Assignment],
    labels: &[ColumnLabel],
) -> Result<Row> {
    let mut values: Vec<Value> = old.values().to_vec();
    for assignment in assignments {
        let idx = table
            .schema()
            .get_column_index(&assignment.column)
            .ok_or_else(|| {
                Error::ColumnNotFound(assignment.column.clone(), table.name().to_string())
            })?;
        values[idx] = evaluate(&assignment.value, old.values(), labels)?;
    }
    check_row(table, &values)?;
    Ok(Row::new(values))
}

/// Assemble and validate a full row for insertion. Missing columns take
/// their declared default or NULL.
pub(crate) fn build_insert_row(
    table: &TableDef,
    columns: Option<&[String]>,
    values: Vec<Value>,
) -> Result<Row> {
    let schema = table.schema();
    let mut row: Vec<Value> = schema
        .columns()
        .iter()
        .map(|c| c.default.clone().unwrap_or(Value::Null))
        .collect();

    match columns {
        None => {
            if values.len() > schema.column_count() {
                return Err(Error::ExecutionError(format!(
                    "{} values for {} columns in '{}'",
                    values.len(),
                    schema.column_count(),
                    table.name()
                )));
            }
            for (i, value) in values.into_iter().enumerate() {
                row[i] = value;
            }
        }
        Some(names) => {
            if values.len() != names.len() {
                return Err(Error::ExecutionError(format!(
                    "{} values for {} named columns in '{}'",
                    values.len(),
                    names.len(),
                    table.name()
                )));
            }
            for (name, value) in names.iter().zip(values) {
                let idx = schema.get_column_index(name).ok_or_else(|| {
                    Error::ColumnNotFound(name.clone(), table.name().to_string())
                })?;
                row[idx] = value;
            }
        }
    }

    check_row(table, &row)?;
    Ok(Row::new(row))
}

/// Nullability and type checks for a fully assembled row
fn check_row(table: &TableDef, values: &[Value]) -> Result<()> {
    for (column, value) in table.schema().columns().iter().zip(values) {
        if value.is_null() {
            if !column.nullable {
                return Err(Error::NullNotAllowed(column.name.clone()));
            }
            continue;
        }
        if !value_fits(&column.data_type, value) {
            return Err(Error::TypeMismatch {
                from: value.type_name().to_string(),
                to: column.data_type.to_string(),
            });
        }
    }
    Ok(())
}

fn value_fits(data_type: &crate::catalog::DataType, value: &Value) -> bool {
    use crate::catalog::DataType;
    match (data_type, value) {
        (DataType::Boolean, Value::Boolean(_)) => true,
        (DataType::SmallInt | DataType::Integer, Value::Integer(_)) => true,
        (DataType::BigInt, Value::Integer(_) | Value::BigInt(_)) => true,
        (DataType::Float | DataType::Double, Value::Float(_)) => true,
        (DataType::Float | DataType::Double, Value::Integer(_) | Value::BigInt(_)) => true,
        (DataType::Char(_) | DataType::Varchar(_) | DataType::Text, Value::String(_)) => true,
        (DataType::Date, Value::Date(_)) => true,
        (DataType::Timestamp, Value::Timestamp(_)) => true,
        _ => false,
    }
}
