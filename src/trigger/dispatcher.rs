//! Trigger Dispatcher
//!
//! Fires registered BEFORE/AFTER procedures around mutations. BEFORE triggers
//! run in registration order before a change is staged and may veto the whole
//! statement; AFTER triggers run once the change is staged and may issue
//! further commands against the same transaction, bounded by a fixed
//! recursion depth.

use tracing::debug;

use crate::catalog::{TriggerEvent, TriggerTiming};
use crate::error::{Error, Result};
use crate::exec::command::Command;
use crate::exec::{ExecOutcome, ExecutionEngine};
use crate::storage::Row;
use crate::transaction::Transaction;

/// Maximum nesting depth for triggers that issue commands which fire further
/// triggers
pub const MAX_TRIGGER_DEPTH: usize = 8;

/// A procedure bound to a trigger. Invoked only by the dispatcher.
pub trait TriggerProcedure: Send + Sync {
    fn fire(&self, ctx: &mut TriggerContext<'_>) -> Result<()>;
}

impl<F> TriggerProcedure for F
where
    F: Fn(&mut TriggerContext<'_>) -> Result<()> + Send + Sync,
{
    fn fire(&self, ctx: &mut TriggerContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Everything a firing trigger can see and do
pub struct TriggerContext<'a> {
    /// Name of the firing trigger
    pub trigger: &'a str,
    /// Table the mutation targets
    pub table: &'a str,
    /// The mutation event
    pub event: TriggerEvent,
    /// BEFORE or AFTER
    pub timing: TriggerTiming,
    /// Row state before the mutation (None for inserts)
    pub old: Option<&'a Row>,
    /// Proposed/staged row state (None for deletes)
    pub new: Option<&'a Row>,
    engine: &'a ExecutionEngine,
    txn: &'a mut Transaction,
}

impl<'a> TriggerContext<'a> {
    /// Veto the mutation. Aborts the whole statement; the enclosing
    /// transaction stays ACTIVE.
    pub fn veto(&self, reason: impl Into<String>) -> Error {
        Error::Veto {
            trigger: self.trigger.to_string(),
            table: self.table.to_string(),
            event: self.event.to_string(),
            reason: reason.into(),
        }
    }

    /// Issue a further command against the same transaction (AFTER triggers;
    /// for example writing an audit row). The command joins the current
    /// statement's atomic scope.
    pub fn execute(&mut self, command: &Command) -> Result<ExecOutcome> {
        self.engine.execute_nested(command, self.txn)
    }
}

/// Trigger Dispatcher - resolves and invokes matching triggers
pub struct TriggerDispatcher;

impl TriggerDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Invoke all BEFORE triggers for (table, event), in registration order.
    /// A `Veto` error from any procedure aborts the statement.
    pub fn dispatch_before(
        &self,
        engine: &ExecutionEngine,
        txn: &mut Transaction,
        table: &str,
        event: TriggerEvent,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        self.dispatch(engine, txn, table, event, TriggerTiming::Before, old, new)
    }

    /// Invoke all AFTER triggers for (table, event), in registration order
    pub fn dispatch_after(
        &self,
        engine: &ExecutionEngine,
        txn: &mut Transaction,
        table: &str,
        event: TriggerEvent,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        self.dispatch(engine, txn, table, event, TriggerTiming::After, old, new)
    }

    fn dispatch(
        &self,
        engine: &ExecutionEngine,
        txn: &mut Transaction,
        table: &str,
        event: TriggerEvent,
        timing: TriggerTiming,
        old: Option<&Row>,
        new: Option<&Row>,
    ) -> Result<()> {
        let triggers = txn.catalog_snapshot().triggers_for(table, event, timing);
        if triggers.is_empty() {
            return Ok(());
        }

        if txn.trigger_depth() >= MAX_TRIGGER_DEPTH {
            return Err(Error::TriggerRecursion(MAX_TRIGGER_DEPTH));
        }

        for def in triggers {
            debug!(trigger = %def.name, table, %event, "firing trigger");
            txn.enter_trigger();
            let mut ctx = TriggerContext {
                trigger: &def.name,
                table,
                event,
                timing,
                old,
                new,
                engine,
                txn: &mut *txn,
            };
            let result = def.procedure.fire(&mut ctx);
            txn.leave_trigger();
            result?;
        }
        Ok(())
    }
}

impl Default for TriggerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
