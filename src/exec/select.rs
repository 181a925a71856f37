//! SELECT pipeline
//!
//! Rows flow source, joins, filter, grouping, projection, DISTINCT,
//! ORDER BY, LIMIT/OFFSET. Sources resolve through the transaction's
//! catalog snapshot, so a SELECT sees one consistent schema and data
//! version for its whole run. Materialized views keep a shared cache
//! keyed by the versions of every base table they read.

use std::collections::{HashMap, HashSet};

use crate::catalog::{CatalogObject, CatalogSnapshot, ViewDef};
use crate::error::Result;
use crate::exec::command::{
    Expr, JoinType, OrderByItem, SelectCommand, SelectItem, TableRef,
};
use crate::exec::eval::{evaluate_predicate, evaluate_scoped, ColumnLabel, EvalScope};
use crate::exec::executor::{ExecutionEngine, ResultSet};
use crate::exec::window::{compare_keys, compute_windows};
use crate::storage::{IndexKey, Row, Value};
use crate::transaction::Transaction;

/// Cached result of a materialized view, tagged with the data versions of
/// every base table it was computed from
pub(crate) struct CachedView {
    pub(crate) deps: Vec<(String, u64)>,
    pub(crate) result: ResultSet,
}

impl ExecutionEngine {
    pub(crate) fn run_select(
        &self,
        select: &SelectCommand,
        txn: &Transaction,
    ) -> Result<ResultSet> {
        let (mut labels, mut rows) = match &select.from {
            None => (Vec::new(), vec![Row::new(Vec::new())]),
            Some(table_ref) => self.source_rows(table_ref, txn)?,
        };

        for join in &select.joins {
            let (right_labels, right_rows) = self.source_rows(&join.table, txn)?;
            let joined_labels: Vec<ColumnLabel> = labels
                .iter()
                .cloned()
                .chain(right_labels.iter().cloned())
                .collect();
            let mut combined = Vec::new();
            for left in &rows {
                let mut matched = false;
                for right in &right_rows {
                    let candidate = left.concat(right);
                    if evaluate_predicate(
                        &join.on,
                        candidate.values(),
                        &joined_labels,
                        EvalScope::default(),
                    )? {
                        combined.push(candidate);
                        matched = true;
                    }
                }
                if !matched && join.join_type == JoinType::Left {
                    let mut padded = left.clone();
                    for _ in 0..right_labels.len() {
                        padded.push(Value::Null);
                    }
                    combined.push(padded);
                }
            }
            labels = joined_labels;
            rows = combined;
        }

        if let Some(filter) = &select.filter {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if evaluate_predicate(filter, row.values(), &labels, EvalScope::default())? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        let grouped = !select.group_by.is_empty()
            || select.having.is_some()
            || select.items.iter().any(|item| {
                matches!(item, SelectItem::Expr { expr, .. } if expr.contains_aggregate())
            });

        let columns = output_columns(select, &labels);

        // (output row, ORDER BY keys) pairs; keys come from the source rows
        // so ordering can use columns the projection drops
        let mut produced: Vec<(Row, Vec<Value>)> = Vec::new();

        if grouped {
            let mut order: Vec<IndexKey> = Vec::new();
            let mut groups: HashMap<IndexKey, Vec<Row>> = HashMap::new();
            for row in rows {
                let key = IndexKey(
                    select
                        .group_by
                        .iter()
                        .map(|e| evaluate_scoped(e, row.values(), &labels, EvalScope::default()))
                        .collect::<Result<Vec<_>>>()?,
                );
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(row);
            }
            // an all-aggregate SELECT over no rows still yields one group
            if order.is_empty() && select.group_by.is_empty() {
                order.push(IndexKey(Vec::new()));
                groups.insert(IndexKey(Vec::new()), Vec::new());
            }

            // Groups surviving HAVING, each with one representative row
            // window functions and projections evaluate against
            let mut kept: Vec<(Vec<Row>, Row)> = Vec::new();
            for key in order {
                let group = groups.remove(&key).unwrap_or_default();
                let representative = group
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Row::new(vec![Value::Null; labels.len()]));
                let scope = EvalScope {
                    group: Some(group.as_slice()),
                    windows: None,
                };
                if let Some(having) = &select.having {
                    if !evaluate_predicate(having, representative.values(), &labels, scope)? {
                        continue;
                    }
                }
                kept.push((group, representative));
            }

            let mut window_exprs = Vec::new();
            collect_select_windows(select, &mut window_exprs);
            let representatives: Vec<Row> =
                kept.iter().map(|(_, rep)| rep.clone()).collect();
            let windows = compute_windows(&window_exprs, &representatives, &labels)?;

            for (i, (group, representative)) in kept.iter().enumerate() {
                let scope = EvalScope {
                    group: Some(group.as_slice()),
                    windows: Some((&windows, i)),
                };
                let out = project_row(select, representative.values(), &labels, scope)?;
                let keys = order_keys(&select.order_by, representative.values(), &labels, scope)?;
                produced.push((out, keys));
            }
        } else {
            let mut window_exprs = Vec::new();
            collect_select_windows(select, &mut window_exprs);
            let windows = compute_windows(&window_exprs, &rows, &labels)?;
            for (i, row) in rows.iter().enumerate() {
                let scope = EvalScope {
                    group: None,
                    windows: Some((&windows, i)),
                };
                let out = project_row(select, row.values(), &labels, scope)?;
                let keys = order_keys(&select.order_by, row.values(), &labels, scope)?;
                produced.push((out, keys));
            }
        }

        if select.distinct {
            let mut seen = HashSet::new();
            produced.retain(|(row, _)| seen.insert(IndexKey(row.values().to_vec())));
        }

        if !select.order_by.is_empty() {
            produced.sort_by(|(_, a), (_, b)| compare_keys(a, b, &select.order_by));
        }

        let rows = produced
            .into_iter()
            .map(|(row, _)| row)
            .skip(select.offset.unwrap_or(0))
            .take(select.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(ResultSet { columns, rows })
    }

    /// Materialize one FROM/JOIN source as labeled rows
    fn source_rows(
        &self,
        table_ref: &TableRef,
        txn: &Transaction,
    ) -> Result<(Vec<ColumnLabel>, Vec<Row>)> {
        let qualifier = Some(table_ref.label().to_string());
        match txn.catalog_snapshot().resolve(&table_ref.name)? {
            CatalogObject::Table(def) => {
                let labels = def
                    .schema()
                    .columns()
                    .iter()
                    .map(|c| ColumnLabel::new(qualifier.clone(), c.name.clone()))
                    .collect();
                let rows = self
                    .storage()
                    .scan(txn, def.name(), None)?
                    .map(|(_, row)| row)
                    .collect();
                Ok((labels, rows))
            }
            CatalogObject::View(view) => {
                let result = self.view_rows(&view, txn)?;
                let labels = result
                    .columns
                    .iter()
                    .map(|c| ColumnLabel::new(qualifier.clone(), c.clone()))
                    .collect();
                Ok((labels, result.rows))
            }
        }
    }

    fn view_rows(&self, view: &ViewDef, txn: &Transaction) -> Result<ResultSet> {
        if !view.materialized {
            return self.run_select(&view.query, txn);
        }

        let mut deps = Vec::new();
        collect_source_tables(&view.query, txn.catalog_snapshot(), &mut deps)?;

        // the shared cache only serves reads of committed data; a transaction
        // with staged writes to a base table evaluates fresh
        let mut versions = Vec::with_capacity(deps.len());
        let mut dirty = false;
        for name in &deps {
            if !txn.overlay_for(name).is_empty() {
                dirty = true;
            }
            let version = txn
                .data_snapshot()
                .table(name)
                .map(|t| t.version())
                .unwrap_or(0);
            versions.push((name.clone(), version));
        }
        if dirty {
            return self.run_select(&view.query, txn);
        }

        {
            let cache = self.view_cache().lock().unwrap();
            if let Some(entry) = cache.get(&view.name) {
                if entry.deps == versions {
                    return Ok(entry.result.clone());
                }
            }
        }

        let result = self.run_select(&view.query, txn)?;
        self.view_cache().lock().unwrap().insert(
            view.name.clone(),
            CachedView {
                deps: versions,
                result: result.clone(),
            },
        );
        Ok(result)
    }
}

/// All base tables a query reads, views resolved transitively
fn collect_source_tables(
    select: &SelectCommand,
    catalog: &CatalogSnapshot,
    out: &mut Vec<String>,
) -> Result<()> {
    let mut names: Vec<&str> = Vec::new();
    if let Some(from) = &select.from {
        names.push(&from.name);
    }
    for join in &select.joins {
        names.push(&join.table.name);
    }
    for name in names {
        match catalog.resolve(name)? {
            CatalogObject::Table(def) => {
                if !out.iter().any(|n| n == def.name()) {
                    out.push(def.name().to_string());
                }
            }
            CatalogObject::View(view) => collect_source_tables(&view.query, catalog, out)?,
        }
    }
    Ok(())
}

fn collect_select_windows<'a>(select: &'a SelectCommand, out: &mut Vec<&'a Expr>) {
    for item in &select.items {
        if let SelectItem::Expr { expr, .. } = item {
            expr.collect_windows(out);
        }
    }
    for item in &select.order_by {
        item.expr.collect_windows(out);
    }
}

fn project_row(
    select: &SelectCommand,
    source: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<Row> {
    let mut values = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::Wildcard => values.extend(source.iter().cloned()),
            SelectItem::Expr { expr, .. } => {
                values.push(evaluate_scoped(expr, source, labels, scope)?);
            }
        }
    }
    Ok(Row::new(values))
}

fn order_keys(
    order_by: &[OrderByItem],
    source: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<Vec<Value>> {
    order_by
        .iter()
        .map(|item| evaluate_scoped(&item.expr, source, labels, scope))
        .collect()
}

fn output_columns(select: &SelectCommand, labels: &[ColumnLabel]) -> Vec<String> {
    let mut columns = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::Wildcard => columns.extend(labels.iter().map(|l| l.name.clone())),
            SelectItem::Expr { expr, alias } => {
                columns.push(alias.clone().unwrap_or_else(|| derive_name(expr)));
            }
        }
    }
    columns
}

fn derive_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(col) => col.column.clone(),
        Expr::Aggregate { func, .. } => format!("{:?}", func).to_lowercase(),
        Expr::Window { func, .. } => match func {
            crate::exec::command::WindowFunc::RowNumber => "row_number".to_string(),
            crate::exec::command::WindowFunc::Rank => "rank".to_string(),
            crate::exec::command::WindowFunc::Lag { .. } => "lag".to_string(),
            crate::exec::command::WindowFunc::Lead { .. } => "lead".to_string(),
            crate::exec::command::WindowFunc::Aggregate { func, .. } => {
                format!("{:?}", func).to_lowercase()
            }
        },
        Expr::Function { name, .. } => name.to_lowercase(),
        _ => "?column?".to_string(),
    }
}
