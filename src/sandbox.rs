//! Sandbox facade
//!
//! Wires the catalog, storage engine, transaction manager and execution
//! engine into one embeddable handle. Host applications hold a `Sandbox`,
//! begin transactions against it and feed typed commands through them.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::exec::command::Command;
use crate::exec::{ExecOutcome, ExecutionEngine};
use crate::storage::StorageEngine;
use crate::transaction::{Transaction, TransactionManager};

/// An embedded SQL execution sandbox
pub struct Sandbox {
    catalog: Arc<Catalog>,
    storage: Arc<StorageEngine>,
    manager: TransactionManager,
    engine: ExecutionEngine,
}

impl Sandbox {
    /// Create an empty sandbox
    pub fn new() -> Self {
        Self::assemble(Arc::new(Catalog::new()), Arc::new(StorageEngine::new()))
    }

    /// Create a sandbox over an existing catalog, for example one restored
    /// from a dump. Tables get empty row stores with their declared indexes.
    pub fn with_catalog(catalog: Catalog) -> Result<Self> {
        let catalog = Arc::new(catalog);
        let storage = Arc::new(StorageEngine::new());
        let snapshot = catalog.snapshot();
        for name in snapshot.list_tables() {
            let def = snapshot.get_table(&name)?;
            let mut data = (*storage.create_table(&name)).clone();
            for index in snapshot.indexes_for(&name) {
                data = data.with_index(&index, &def)?;
            }
            storage.replace_table(&name, data);
        }
        Ok(Self::assemble(catalog, storage))
    }

    fn assemble(catalog: Arc<Catalog>, storage: Arc<StorageEngine>) -> Self {
        let manager = TransactionManager::new(catalog.clone(), storage.clone());
        let engine = ExecutionEngine::new(catalog.clone(), storage.clone());
        Self {
            catalog,
            storage,
            manager,
            engine,
        }
    }

    /// The shared catalog
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Begin a new transaction with fresh schema and data snapshots
    pub fn begin(&self) -> Transaction {
        self.manager.begin()
    }

    /// Execute one command inside a transaction
    pub fn execute(&self, command: &Command, txn: &mut Transaction) -> Result<ExecOutcome> {
        self.engine.execute(command, txn)
    }

    /// Commit a transaction, validating integrity constraints
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.manager.commit(txn)
    }

    /// Roll back a transaction, discarding every staged change
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        self.manager.rollback(txn)
    }

    /// Run a single command in its own transaction and commit it
    pub fn run(&self, command: &Command) -> Result<ExecOutcome> {
        let mut txn = self.begin();
        let outcome = match self.execute(command, &mut txn) {
            Ok(outcome) => outcome,
            Err(err) => {
                if txn.is_active() {
                    self.manager.rollback(&mut txn)?;
                }
                return Err(err);
            }
        };
        self.commit(&mut txn)?;
        Ok(outcome)
    }

    /// Persist table and index definitions as JSON
    pub fn save_catalog(&self, path: &str) -> Result<()> {
        self.catalog.save_to_disk(path)
    }

    /// Restore a sandbox from a catalog dump
    pub fn load_catalog(path: &str) -> Result<Self> {
        Self::with_catalog(Catalog::load_from_disk(path)?)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}
