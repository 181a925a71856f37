//! Transaction Manager
//!
//! Handles transaction lifecycle (begin, commit, rollback), the isolated
//! working set of tentative row changes, and statement-level undo.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogSnapshot};
use crate::error::{Error, Result};
use crate::storage::{DataSnapshot, Row, RowKey, StorageEngine, TableData};

/// Transaction State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// One tentative row change in a working set. `before` is the committed row
/// as of the transaction's snapshot; `after = None` is a delete.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub before: Option<Row>,
    pub after: Option<Row>,
}

/// Undo record for statement-level rollback
#[derive(Debug)]
enum UndoEntry {
    /// The statement created this working-set entry
    Created {
        slot: (String, RowKey),
        fresh_intent: bool,
    },
    /// The statement overwrote an entry staged by an earlier statement
    Overwrote {
        slot: (String, RowKey),
        prior: RowChange,
    },
}

/// An active unit of work over a schema/data snapshot
pub struct Transaction {
    id: u64,
    state: TransactionState,
    /// Schema as of begin
    catalog: Arc<CatalogSnapshot>,
    /// Data as of begin
    data: DataSnapshot,
    /// Tentative changes in staging order
    working: IndexMap<(String, RowKey), RowChange>,
    /// Undo journal for the statement currently executing
    undo: Vec<UndoEntry>,
    /// Trigger nesting depth of the statement currently executing
    trigger_depth: usize,
}

impl Transaction {
    /// Transaction ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether the transaction can still execute statements
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Fail unless the transaction is still ACTIVE
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::TransactionFinished(self.id))
        }
    }

    /// The schema snapshot this transaction resolves names against
    pub fn catalog_snapshot(&self) -> &Arc<CatalogSnapshot> {
        &self.catalog
    }

    /// The data snapshot this transaction reads from
    pub fn data_snapshot(&self) -> &DataSnapshot {
        &self.data
    }

    /// Refresh the schema snapshot after this transaction itself ran DDL, so
    /// it can use objects it just defined. Other transactions keep their own
    /// snapshots.
    pub fn adopt_catalog(&mut self, snapshot: Arc<CatalogSnapshot>) {
        self.catalog = snapshot;
    }

    /// Make a table this transaction just created (or rebuilt) visible in its
    /// own data snapshot
    pub fn adopt_table(&mut self, name: &str, data: Arc<TableData>) {
        self.data.refresh_table(name, data);
    }

    /// Remove a dropped table from this transaction's view
    pub fn forget_table(&mut self, name: &str) {
        self.data.forget_table(name);
        self.working.retain(|(table, _), _| table != name);
    }

    /// The staged change for one row, if any
    pub fn staged_change(&self, table: &str, key: &RowKey) -> Option<&RowChange> {
        self.working.get(&(table.to_string(), key.clone()))
    }

    /// Staged changes for one table as an ordered overlay for scans
    pub fn overlay_for(&self, table: &str) -> BTreeMap<RowKey, Option<Row>> {
        self.working
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|((_, key), change)| (key.clone(), change.after.clone()))
            .collect()
    }

    /// Whether any change is staged
    pub fn has_changes(&self) -> bool {
        !self.working.is_empty()
    }

    /// Staged changes grouped by table
    pub fn changes_by_table(&self) -> HashMap<String, Vec<(&RowKey, &RowChange)>> {
        let mut grouped: HashMap<String, Vec<(&RowKey, &RowChange)>> = HashMap::new();
        for ((table, key), change) in &self.working {
            grouped.entry(table.clone()).or_default().push((key, change));
        }
        grouped
    }

    /// Record a change in the working set, journaling it for statement undo
    pub fn stage(&mut self, table: &str, key: RowKey, change: RowChange, fresh_intent: bool) {
        let slot = (table.to_string(), key);
        match self.working.insert(slot.clone(), change) {
            Some(prior) => self.undo.push(UndoEntry::Overwrote { slot, prior }),
            None => self.undo.push(UndoEntry::Created { slot, fresh_intent }),
        }
    }

    /// Mark the start of a statement: clears the undo journal so a veto or
    /// mid-statement failure rewinds exactly this statement's effects.
    pub fn begin_statement(&mut self) {
        self.undo.clear();
        self.trigger_depth = 0;
    }

    /// Rewind the current statement's staged changes, releasing intents the
    /// statement acquired. The transaction stays ACTIVE.
    pub fn undo_statement(&mut self, storage: &StorageEngine) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                UndoEntry::Created { slot, fresh_intent } => {
                    self.working.shift_remove(&slot);
                    if fresh_intent {
                        storage.release_intent(&slot.0, &slot.1, self.id);
                    }
                }
                UndoEntry::Overwrote { slot, prior } => {
                    self.working.insert(slot, prior);
                }
            }
        }
    }

    /// Abort in place, dropping all staged changes and releasing intents.
    /// Used when a statement failure poisons the whole transaction.
    pub(crate) fn force_abort(&mut self, storage: &StorageEngine) {
        self.state = TransactionState::Aborted;
        self.working.clear();
        self.undo.clear();
        storage.release_all_intents(self.id);
    }

    /// Current trigger nesting depth
    pub fn trigger_depth(&self) -> usize {
        self.trigger_depth
    }

    /// Enter a nested trigger invocation
    pub fn enter_trigger(&mut self) {
        self.trigger_depth += 1;
    }

    /// Leave a nested trigger invocation
    pub fn leave_trigger(&mut self) {
        self.trigger_depth = self.trigger_depth.saturating_sub(1);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("staged", &self.working.len())
            .finish()
    }
}

/// Transaction Manager - creates transactions and drives commit/rollback
pub struct TransactionManager {
    catalog: Arc<Catalog>,
    storage: Arc<StorageEngine>,
    next_txn_id: Mutex<u64>,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(catalog: Arc<Catalog>, storage: Arc<StorageEngine>) -> Self {
        Self {
            catalog,
            storage,
            next_txn_id: Mutex::new(1),
        }
    }

    /// Begin a new ACTIVE transaction over fresh schema and data snapshots
    pub fn begin(&self) -> Transaction {
        let id = {
            let mut next = self.next_txn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        debug!(txn = id, "transaction started");
        Transaction {
            id,
            state: TransactionState::Active,
            catalog: self.catalog.snapshot(),
            data: self.storage.snapshot(),
            working: IndexMap::new(),
            undo: Vec::new(),
            trigger_depth: 0,
        }
    }

    /// Commit: validate integrity over the working set and atomically publish
    /// every staged change, or abort on violation.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_active()?;

        match self.storage.commit_apply(txn.catalog_snapshot(), txn) {
            Ok(()) => {
                txn.state = TransactionState::Committed;
                self.storage.release_all_intents(txn.id);
                info!(txn = txn.id, "transaction committed");
                Ok(())
            }
            Err(err) => {
                // Commit-time integrity failure aborts rather than partially
                // applying changes.
                txn.state = TransactionState::Aborted;
                txn.working.clear();
                self.storage.release_all_intents(txn.id);
                info!(txn = txn.id, error = %err, "transaction aborted at commit");
                Err(err)
            }
        }
    }

    /// Roll back: discard the working set unconditionally
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_active()?;
        txn.working.clear();
        txn.undo.clear();
        txn.state = TransactionState::Aborted;
        self.storage.release_all_intents(txn.id);
        info!(txn = txn.id, "transaction rolled back");
        Ok(())
    }

    /// Mark a transaction aborted after a fatal statement error (for example
    /// trigger recursion overflow)
    pub fn abort(&self, txn: &mut Transaction) {
        if txn.is_active() {
            txn.working.clear();
            txn.undo.clear();
            txn.state = TransactionState::Aborted;
            self.storage.release_all_intents(txn.id);
            info!(txn = txn.id, "transaction aborted");
        }
    }
}
