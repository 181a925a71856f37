//! MERGE execution
//!
//! Runs in two passes over a materialized source row set. Pass one walks
//! source rows and applies WHEN MATCHED or WHEN NOT MATCHED, pass two
//! walks the remaining target rows for WHEN NOT MATCHED BY SOURCE. A
//! target row takes at most one action per MERGE.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::exec::command::{Assignment, MergeAction, MergeCommand};
use crate::exec::eval::{evaluate, ColumnLabel};
use crate::exec::executor::{build_insert_row, ExecutionEngine};
use crate::storage::{Row, RowKey, Value};
use crate::transaction::Transaction;

impl ExecutionEngine {
    pub(crate) fn run_merge(&self, merge: &MergeCommand, txn: &mut Transaction) -> Result<usize> {
        let table = txn.catalog_snapshot().get_table(&merge.target)?;

        let source = self.run_select(&merge.source, txn)?;
        let source_labels: Vec<ColumnLabel> = source
            .columns
            .iter()
            .map(|c| ColumnLabel::new(Some(merge.source_alias.clone()), c.clone()))
            .collect();
        let source_on = source
            .columns
            .iter()
            .position(|c| c == &merge.on.source_column)
            .ok_or_else(|| {
                Error::ColumnNotFound(merge.on.source_column.clone(), merge.source_alias.clone())
            })?;

        let target_labels: Vec<ColumnLabel> = table
            .schema()
            .columns()
            .iter()
            .map(|c| ColumnLabel::new(Some(table.name().to_string()), c.name.clone()))
            .collect();
        let target_on = table
            .schema()
            .get_column_index(&merge.on.target_column)
            .ok_or_else(|| {
                Error::ColumnNotFound(merge.on.target_column.clone(), table.name().to_string())
            })?;

        let target_rows: Vec<(RowKey, Row)> = self
            .storage()
            .scan(txn, table.name(), None)?
            .collect();

        let mut taken: HashSet<RowKey> = HashSet::new();
        let mut affected = 0;

        for source_row in &source.rows {
            let source_key = &source_row.values()[source_on];
            let matched = target_rows.iter().find(|(key, row)| {
                !taken.contains(key)
                    && !source_key.is_null()
                    && row.values()[target_on].compare(source_key) == Some(Ordering::Equal)
            });

            match matched {
                Some((key, old)) => {
                    taken.insert(key.clone());
                    let Some(action) = &merge.when_matched else {
                        continue;
                    };
                    match action {
                        MergeAction::Update(assignments) => {
                            let env = old.concat(source_row);
                            let env_labels: Vec<ColumnLabel> = target_labels
                                .iter()
                                .cloned()
                                .chain(source_labels.iter().cloned())
                                .collect();
                            let new =
                                assigned_row(&table, old, assignments, env.values(), &env_labels)?;
                            self.update_row(&table, key, old, new, txn)?;
                        }
                        MergeAction::Delete => {
                            self.delete_row(&table, key, old, txn)?;
                        }
                    }
                    affected += 1;
                }
                None => {
                    let Some(insert) = &merge.when_not_matched else {
                        continue;
                    };
                    let values = insert
                        .values
                        .iter()
                        .map(|e| evaluate(e, source_row.values(), &source_labels))
                        .collect::<Result<Vec<_>>>()?;
                    let row = build_insert_row(&table, insert.columns.as_deref(), values)?;
                    self.insert_row(&table, row, txn)?;
                    affected += 1;
                }
            }
        }

        if let Some(action) = &merge.when_not_matched_by_source {
            for (key, old) in &target_rows {
                if taken.contains(key) {
                    continue;
                }
                match action {
                    MergeAction::Update(assignments) => {
                        let new = assigned_row(
                            &table,
                            old,
                            assignments,
                            old.values(),
                            &target_labels,
                        )?;
                        self.update_row(&table, key, old, new, txn)?;
                    }
                    MergeAction::Delete => {
                        self.delete_row(&table, key, old, txn)?;
                    }
                }
                affected += 1;
            }
        }

        Ok(affected)
    }
}

fn assigned_row(
    table: &crate::catalog::TableDef,
    old: &Row,
    assignments: &[Assignment],
    env: &[Value],
    env_labels: &[ColumnLabel],
) -> Result<Row> {
    let mut values: Vec<Value> = old.values().to_vec();
    for assignment in assignments {
        let idx = table
            .schema()
            .get_column_index(&assignment.column)
            .ok_or_else(|| {
                Error::ColumnNotFound(assignment.column.clone(), table.name().to_string())
            })?;
        values[idx] = evaluate(&assignment.value, env, env_labels)?;
    }
    Ok(Row::new(values))
}
