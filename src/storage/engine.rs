//! Storage Engine for ChalkDB
//!
//! Shared committed state lives behind a single RwLock as a map of
//! `Arc<TableData>`. Transactions read a snapshot captured at begin and stage
//! their own changes; nothing here mutates shared state except `commit_apply`,
//! which validates and publishes a whole working set atomically.
//!
//! Write conflicts are resolved optimistically: staging a change takes an
//! exclusive per-key intent, and a conflicting stage fails immediately with
//! `WriteConflict` instead of blocking.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::catalog::{CatalogSnapshot, TableDef};
use crate::error::{Error, Result};
use crate::storage::row::{IndexKey, Row, RowKey, Value};
use crate::storage::table::TableData;
use crate::transaction::{RowChange, Transaction};

/// Predicate pushed into a scan; rows failing it are skipped lazily
pub type ScanPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// A fixed view of all committed table data as of one point in time
#[derive(Debug, Clone, Default)]
pub struct DataSnapshot {
    tables: HashMap<String, Arc<TableData>>,
}

impl DataSnapshot {
    /// Get a table's committed state, if the table existed at snapshot time
    pub fn table(&self, name: &str) -> Option<&Arc<TableData>> {
        self.tables.get(name)
    }

    /// Replace one table entry (used when a transaction creates a table and
    /// must see it in its own snapshot)
    pub fn refresh_table(&mut self, name: &str, data: Arc<TableData>) {
        self.tables.insert(name.to_string(), data);
    }

    /// Remove one table entry
    pub fn forget_table(&mut self, name: &str) {
        self.tables.remove(name);
    }
}

/// Storage Engine - committed state, snapshots and per-key write intents
pub struct StorageEngine {
    /// Committed table data by name
    committed: RwLock<HashMap<String, Arc<TableData>>>,
    /// Exclusive write intents: (table, key) -> holding transaction
    intents: Mutex<HashMap<(String, RowKey), u64>>,
    /// Next surrogate row identity per table
    surrogates: Mutex<HashMap<String, u64>>,
}

impl StorageEngine {
    /// Create a new empty storage engine
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(HashMap::new()),
            intents: Mutex::new(HashMap::new()),
            surrogates: Mutex::new(HashMap::new()),
        }
    }

    /// Capture a snapshot of all committed table data
    pub fn snapshot(&self) -> DataSnapshot {
        DataSnapshot {
            tables: self.committed.read().unwrap().clone(),
        }
    }

    /// Register storage for a newly defined table
    pub fn create_table(&self, name: &str) -> Arc<TableData> {
        let data = Arc::new(TableData::new(name));
        self.committed
            .write()
            .unwrap()
            .insert(name.to_string(), data.clone());
        data
    }

    /// Drop a table's storage
    pub fn drop_table(&self, name: &str) {
        self.committed.write().unwrap().remove(name);
        self.surrogates.lock().unwrap().remove(name);
        self.intents
            .lock()
            .unwrap()
            .retain(|(table, _), _| table != name);
    }

    /// Current committed state for one table (latest, not snapshot)
    pub fn committed_table(&self, name: &str) -> Option<Arc<TableData>> {
        self.committed.read().unwrap().get(name).cloned()
    }

    /// Swap in a rebuilt table (index creation/drop backfill)
    pub fn replace_table(&self, name: &str, data: TableData) {
        self.committed
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(data));
    }

    /// Next synthetic row identity for a table without a primary key
    fn next_surrogate(&self, table: &str) -> u64 {
        let mut surrogates = self.surrogates.lock().unwrap();
        let next = surrogates.entry(table.to_string()).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    /// Claim an exclusive intent on a row key. Returns true if the intent is
    /// newly acquired, false if the transaction already held it.
    pub fn acquire_intent(&self, table: &str, key: &RowKey, txn_id: u64) -> Result<bool> {
        let mut intents = self.intents.lock().unwrap();
        let slot = (table.to_string(), key.clone());
        match intents.get(&slot) {
            Some(&holder) if holder == txn_id => Ok(false),
            Some(&holder) => Err(Error::WriteConflict {
                table: table.to_string(),
                key: key.clone(),
                reason: format!("claimed by transaction {holder}"),
            }),
            None => {
                intents.insert(slot, txn_id);
                Ok(true)
            }
        }
    }

    /// Release one intent held by a transaction
    pub fn release_intent(&self, table: &str, key: &RowKey, txn_id: u64) {
        let mut intents = self.intents.lock().unwrap();
        let slot = (table.to_string(), key.clone());
        if intents.get(&slot) == Some(&txn_id) {
            intents.remove(&slot);
        }
    }

    /// Release every intent held by a transaction
    pub fn release_all_intents(&self, txn_id: u64) {
        self.intents.lock().unwrap().retain(|_, &mut h| h != txn_id);
    }

    /// Read a single row as the transaction sees it: its own staged change
    /// first, then the snapshot.
    pub fn get(&self, txn: &Transaction, table: &str, key: &RowKey) -> Option<Row> {
        if let Some(change) = txn.staged_change(table, key) {
            return change.after.clone();
        }
        txn.data_snapshot()
            .table(table)
            .and_then(|data| data.get(key).cloned())
    }

    /// Lazily scan a table as the transaction sees it. The scan is finite,
    /// restartable, and yields row by row so callers can stop between rows.
    pub fn scan(
        &self,
        txn: &Transaction,
        table: &str,
        predicate: Option<ScanPredicate>,
    ) -> Result<RowScan> {
        let base = txn
            .data_snapshot()
            .table(table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        let overlay = txn.overlay_for(table);
        Ok(RowScan {
            base,
            overlay,
            predicate,
            cursor: None,
        })
    }

    /// Stage a new row. Computes its identity (primary-key values or a fresh
    /// surrogate), rejects duplicate keys against the transaction's merged
    /// view, claims the intent and records the change in the working set.
    pub fn put(&self, txn: &mut Transaction, table: &TableDef, row: Row) -> Result<RowKey> {
        let key = self.row_key(txn, table, &row)?;

        // Duplicate check against the transaction's own merged view
        if self.get(txn, table.name(), &key).is_some() {
            return Err(Error::DuplicateKey {
                table: table.name().to_string(),
                key,
            });
        }

        let before = txn
            .data_snapshot()
            .table(table.name())
            .and_then(|data| data.get(&key).cloned());
        let fresh = self.acquire_intent(table.name(), &key, txn.id())?;
        txn.stage(
            table.name(),
            key.clone(),
            RowChange {
                before,
                after: Some(row),
            },
            fresh,
        );
        Ok(key)
    }

    /// Stage an update to an existing row (identity unchanged)
    pub fn update(
        &self,
        txn: &mut Transaction,
        table: &str,
        key: &RowKey,
        new_row: Row,
    ) -> Result<()> {
        if self.get(txn, table, key).is_none() {
            return Err(Error::Internal(format!(
                "update of missing row {} in '{}'",
                key, table
            )));
        }
        let before = txn
            .data_snapshot()
            .table(table)
            .and_then(|data| data.get(key).cloned());
        let fresh = self.acquire_intent(table, key, txn.id())?;
        txn.stage(
            table,
            key.clone(),
            RowChange {
                before,
                after: Some(new_row),
            },
            fresh,
        );
        Ok(())
    }

    /// Stage a delete, returning the row as it was visible to the transaction
    pub fn delete(&self, txn: &mut Transaction, table: &str, key: &RowKey) -> Result<Option<Row>> {
        let visible = self.get(txn, table, key);
        if visible.is_none() {
            return Ok(None);
        }
        let before = txn
            .data_snapshot()
            .table(table)
            .and_then(|data| data.get(key).cloned());
        let fresh = self.acquire_intent(table, key, txn.id())?;
        txn.stage(
            table,
            key.clone(),
            RowChange {
                before,
                after: None,
            },
            fresh,
        );
        Ok(visible)
    }

    /// Compute a row's identity from the table's primary key, or assign a
    /// surrogate when no primary key is declared.
    pub fn row_key(&self, _txn: &Transaction, table: &TableDef, row: &Row) -> Result<RowKey> {
        let pk = table.schema().primary_key_positions();
        if pk.is_empty() {
            return Ok(RowKey::Surrogate(self.next_surrogate(table.name())));
        }
        let mut values = Vec::with_capacity(pk.len());
        for pos in pk {
            let value = row.get(pos).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                let column = &table.schema().columns()[pos].name;
                return Err(Error::NullNotAllowed(column.clone()));
            }
            values.push(value);
        }
        Ok(RowKey::Key(IndexKey::composite(values)))
    }

    /// Validate and atomically publish a transaction's working set. Runs
    /// entirely under the committed-state write lock so validation and
    /// publication cannot interleave with another commit.
    pub fn commit_apply(&self, catalog: &CatalogSnapshot, txn: &Transaction) -> Result<()> {
        let mut committed = self.committed.write().unwrap();

        // Build successor states for every touched table
        let mut successors: HashMap<String, Arc<TableData>> = HashMap::new();
        for (table, changes) in txn.changes_by_table() {
            let current = committed
                .get(table.as_str())
                .cloned()
                .ok_or_else(|| Error::TableNotFound(table.clone()))?;
            // First committer wins: every staged change must still find the
            // row it observed. Intents only guard concurrent ACTIVE
            // transactions, so a commit published after this transaction's
            // snapshot is caught here.
            for (key, change) in &changes {
                match (&change.before, current.get(key)) {
                    (None, Some(_)) if change.after.is_some() => {
                        return Err(Error::DuplicateKey {
                            table: table.clone(),
                            key: (*key).clone(),
                        });
                    }
                    (Some(_), None) => {
                        return Err(Error::WriteConflict {
                            table: table.clone(),
                            key: (*key).clone(),
                            reason: "row was deleted by a concurrent commit".to_string(),
                        });
                    }
                    (Some(before), Some(now)) if before != now => {
                        return Err(Error::WriteConflict {
                            table: table.clone(),
                            key: (*key).clone(),
                            reason: "row was changed by a concurrent commit".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            let next = current.with_changes(
                changes
                    .iter()
                    .map(|(key, change)| (*key, change.before.as_ref(), change.after.as_ref())),
            )?;
            successors.insert(table.clone(), Arc::new(next));
        }

        // The final state a reference check must run against
        let final_table = |name: &str| -> Option<Arc<TableData>> {
            successors
                .get(name)
                .cloned()
                .or_else(|| committed.get(name).cloned())
        };

        for (table_name, next) in &successors {
            let def = catalog.get_table(table_name)?;
            self.validate_unique_columns(&def, next)?;
            self.validate_outgoing_references(catalog, &def, next, &final_table)?;
        }
        self.validate_incoming_references(catalog, txn, &final_table)?;

        for (name, next) in successors {
            debug!(table = %name, version = next.version(), "publishing table");
            committed.insert(name, next);
        }
        Ok(())
    }

    /// Every column flagged UNIQUE must hold distinct non-null values
    fn validate_unique_columns(&self, def: &TableDef, data: &TableData) -> Result<()> {
        for column in def.schema().columns().iter().filter(|c| c.unique) {
            let mut seen = std::collections::HashSet::new();
            for (key, row) in data.rows() {
                if let Some(value) = row.get(column.position) {
                    if !value.is_null() && !seen.insert(value.clone()) {
                        return Err(Error::ConstraintViolation {
                            constraint: format!("unique_{}", column.name),
                            table: def.name().to_string(),
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Every non-null foreign-key value in the final state must resolve to an
    /// existing primary key in the referenced table's final state
    fn validate_outgoing_references<F>(
        &self,
        _catalog: &CatalogSnapshot,
        def: &TableDef,
        data: &TableData,
        final_table: &F,
    ) -> Result<()>
    where
        F: Fn(&str) -> Option<Arc<TableData>>,
    {
        for fk in &def.foreign_keys {
            let positions: Vec<usize> = fk
                .columns
                .iter()
                .filter_map(|c| def.schema().get_column_index(c))
                .collect();
            let target = final_table(&fk.ref_table)
                .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?;

            for (key, row) in data.rows() {
                let values: Vec<Value> = positions
                    .iter()
                    .map(|&p| row.get(p).cloned().unwrap_or(Value::Null))
                    .collect();
                if values.iter().any(Value::is_null) {
                    continue;
                }
                let ref_key = RowKey::Key(IndexKey::composite(values));
                if target.get(&ref_key).is_none() {
                    return Err(Error::ConstraintViolation {
                        constraint: fk.name.clone(),
                        table: def.name().to_string(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A delete must not orphan committed rows in referencing tables
    fn validate_incoming_references<F>(
        &self,
        catalog: &CatalogSnapshot,
        txn: &Transaction,
        final_table: &F,
    ) -> Result<()>
    where
        F: Fn(&str) -> Option<Arc<TableData>>,
    {
        let deleted: Vec<(String, RowKey)> = txn
            .changes_by_table()
            .iter()
            .flat_map(|(table, changes)| {
                changes
                    .iter()
                    .filter(|(_, c)| c.after.is_none())
                    .map(|(key, _)| ((*table).clone(), (*key).clone()))
            })
            .collect();
        if deleted.is_empty() {
            return Ok(());
        }

        for referencing in catalog.list_tables() {
            let def = catalog.get_table(&referencing)?;
            for fk in &def.foreign_keys {
                let affected: Vec<&RowKey> = deleted
                    .iter()
                    .filter(|(table, _)| *table == fk.ref_table)
                    .map(|(_, key)| key)
                    .collect();
                if affected.is_empty() {
                    continue;
                }
                let positions: Vec<usize> = fk
                    .columns
                    .iter()
                    .filter_map(|c| def.schema().get_column_index(c))
                    .collect();
                let data = match final_table(&referencing) {
                    Some(data) => data,
                    None => continue,
                };
                for (key, row) in data.rows() {
                    let values: Vec<Value> = positions
                        .iter()
                        .map(|&p| row.get(p).cloned().unwrap_or(Value::Null))
                        .collect();
                    if values.iter().any(Value::is_null) {
                        continue;
                    }
                    let ref_key = RowKey::Key(IndexKey::composite(values));
                    if affected.contains(&&ref_key) {
                        return Err(Error::ConstraintViolation {
                            constraint: fk.name.clone(),
                            table: referencing.clone(),
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy, restartable scan over a snapshot with the transaction's own staged
/// changes overlaid. Owns its inputs, so it stays valid while the caller
/// stages further changes.
pub struct RowScan {
    base: Arc<TableData>,
    overlay: BTreeMap<RowKey, Option<Row>>,
    predicate: Option<ScanPredicate>,
    cursor: Option<RowKey>,
}

impl RowScan {
    /// Reset the scan to the beginning
    pub fn restart(&mut self) {
        self.cursor = None;
    }

    fn lower_bound(&self) -> Bound<RowKey> {
        match &self.cursor {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        }
    }
}

impl Iterator for RowScan {
    type Item = (RowKey, Row);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let lower = self.lower_bound();
            let next_base = self
                .base
                .rows()
                .range((lower.clone(), Bound::Unbounded))
                .next();
            let next_overlay = self.overlay.range((lower, Bound::Unbounded)).next();

            // Pick the smallest key; the overlay wins ties.
            let (key, row) = match (next_base, next_overlay) {
                (None, None) => return None,
                (Some((bk, br)), None) => (bk.clone(), Some(br.clone())),
                (None, Some((ok, ov))) => (ok.clone(), ov.clone()),
                (Some((bk, br)), Some((ok, ov))) => {
                    if ok <= bk {
                        (ok.clone(), ov.clone())
                    } else {
                        (bk.clone(), Some(br.clone()))
                    }
                }
            };

            self.cursor = Some(key.clone());
            match row {
                // Staged delete: skip
                None => continue,
                Some(row) => {
                    if let Some(pred) = &self.predicate {
                        if !pred(&row) {
                            continue;
                        }
                    }
                    return Some((key, row));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DataType, TableBuilder};
    use crate::transaction::{Transaction, TransactionManager};

    fn setup() -> (Arc<StorageEngine>, TransactionManager, Arc<TableDef>) {
        let catalog = Arc::new(Catalog::new());
        let storage = Arc::new(StorageEngine::new());
        let def = TableBuilder::new("users")
            .primary_key("id")
            .column("name", DataType::Text)
            .build(&catalog)
            .unwrap();
        storage.create_table("users");
        let manager = TransactionManager::new(catalog, storage.clone());
        (storage, manager, def)
    }

    fn user(id: i32, name: &str) -> Row {
        Row::new(vec![Value::Integer(id), Value::String(name.to_string())])
    }

    fn seed(storage: &StorageEngine, manager: &TransactionManager, def: &TableDef, rows: &[(i32, &str)]) {
        let mut txn = manager.begin();
        for (id, name) in rows {
            storage.put(&mut txn, def, user(*id, name)).unwrap();
        }
        manager.commit(&mut txn).unwrap();
    }

    #[test]
    fn test_scan_merges_staged_changes_over_snapshot() {
        let (storage, manager, def) = setup();
        seed(&storage, &manager, &def, &[(1, "Alice"), (2, "Bob")]);

        let mut txn = manager.begin();
        storage.put(&mut txn, &def, user(3, "Carol")).unwrap();
        let key2 = storage.row_key(&txn, &def, &user(2, "")).unwrap();
        storage.delete(&mut txn, "users", &key2).unwrap();

        let names: Vec<Row> = storage
            .scan(&txn, "users", None)
            .unwrap()
            .map(|(_, row)| row)
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].get(0), Some(&Value::Integer(1)));
        assert_eq!(names[1].get(0), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_scan_restart_replays_from_the_top() {
        let (storage, manager, def) = setup();
        seed(&storage, &manager, &def, &[(1, "Alice"), (2, "Bob"), (3, "Carol")]);

        let txn = manager.begin();
        let mut scan = storage.scan(&txn, "users", None).unwrap();
        assert!(scan.next().is_some());
        assert!(scan.next().is_some());

        scan.restart();
        assert_eq!(scan.count(), 3);
    }

    #[test]
    fn test_scan_predicate_filters_rows() {
        let (storage, manager, def) = setup();
        seed(&storage, &manager, &def, &[(1, "Alice"), (2, "Bob")]);

        let txn = manager.begin();
        let pred: ScanPredicate =
            Arc::new(|row: &Row| row.get(1) == Some(&Value::String("Bob".to_string())));
        let rows: Vec<(RowKey, Row)> = storage.scan(&txn, "users", Some(pred)).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get(0), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_conflicting_intent_is_rejected() {
        let (storage, manager, def) = setup();
        seed(&storage, &manager, &def, &[(1, "Alice")]);

        let mut first = manager.begin();
        let mut second = manager.begin();
        let key = storage.row_key(&first, &def, &user(1, "")).unwrap();

        storage
            .update(&mut first, "users", &key, user(1, "Alicia"))
            .unwrap();
        let err = storage.update(&mut second, "users", &key, user(1, "Al"));
        assert!(matches!(err, Err(Error::WriteConflict { .. })));

        // Released intents free the key for later transactions
        manager.commit(&mut first).unwrap();
        let mut third = manager.begin();
        storage
            .update(&mut third, "users", &key, user(1, "Alex"))
            .unwrap();
    }

    fn visible(storage: &StorageEngine, txn: &Transaction) -> usize {
        storage.scan(txn, "users", None).unwrap().count()
    }

    #[test]
    fn test_snapshot_does_not_see_later_commits() {
        let (storage, manager, def) = setup();
        seed(&storage, &manager, &def, &[(1, "Alice")]);

        let reader = manager.begin();
        seed(&storage, &manager, &def, &[(2, "Bob")]);

        assert_eq!(visible(&storage, &reader), 1);
        assert_eq!(visible(&storage, &manager.begin()), 2);
    }
}
