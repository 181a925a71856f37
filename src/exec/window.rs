//! Window function computation
//!
//! Window expressions are evaluated once per SELECT over the post-filter
//! row set, producing one value per input row. Partitions are formed by
//! the evaluated PARTITION BY keys; ties in the window ORDER BY keep
//! input order.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::Result;
use crate::exec::command::{Expr, OrderByItem, WindowFunc};
use crate::exec::eval::{compute_aggregate, evaluate, ColumnLabel};
use crate::storage::{IndexKey, Row, Value};

/// Compute the values of every window expression in `exprs` for every row.
/// The result pairs each expression with a vector aligned to `rows`.
pub fn compute_windows<'a>(
    exprs: &[&'a Expr],
    rows: &[Row],
    labels: &[ColumnLabel],
) -> Result<Vec<(&'a Expr, Vec<Value>)>> {
    let mut computed = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let Expr::Window { func, over } = expr else {
            continue;
        };
        let mut values = vec![Value::Null; rows.len()];
        for partition in partition_rows(&over.partition_by, rows, labels)? {
            let ordered = order_partition(&partition, &over.order_by, rows, labels)?;
            fill_partition(func, &ordered, rows, labels, &mut values)?;
        }
        computed.push((*expr, values));
    }
    Ok(computed)
}

/// Group row indices by their evaluated partition keys, keeping input order
/// within each partition
fn partition_rows(
    partition_by: &[Expr],
    rows: &[Row],
    labels: &[ColumnLabel],
) -> Result<Vec<Vec<usize>>> {
    if partition_by.is_empty() {
        return Ok(vec![(0..rows.len()).collect()]);
    }
    let mut groups: HashMap<IndexKey, usize> = HashMap::new();
    let mut partitions: Vec<Vec<usize>> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let key = IndexKey(
            partition_by
                .iter()
                .map(|e| evaluate(e, row.values(), labels))
                .collect::<Result<Vec<_>>>()?,
        );
        let slot = *groups.entry(key).or_insert_with(|| {
            partitions.push(Vec::new());
            partitions.len() - 1
        });
        partitions[slot].push(i);
    }
    Ok(partitions)
}

/// Sort a partition's row indices by the window ORDER BY keys. Also returns
/// the keys so rank computation can detect ties.
fn order_partition(
    partition: &[usize],
    order_by: &[OrderByItem],
    rows: &[Row],
    labels: &[ColumnLabel],
) -> Result<Vec<(usize, Vec<Value>)>> {
    let mut keyed: Vec<(usize, Vec<Value>)> = partition
        .iter()
        .map(|&i| {
            let keys = order_by
                .iter()
                .map(|item| evaluate(&item.expr, rows[i].values(), labels))
                .collect::<Result<Vec<_>>>()?;
            Ok((i, keys))
        })
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|(_, a), (_, b)| compare_keys(a, b, order_by));
    Ok(keyed)
}

pub(crate) fn compare_keys(a: &[Value], b: &[Value], order_by: &[OrderByItem]) -> Ordering {
    for (item, (av, bv)) in order_by.iter().zip(a.iter().zip(b.iter())) {
        let ord = match (av.is_null(), bv.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => av.compare(bv).unwrap_or(Ordering::Equal),
        };
        let ord = if item.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn fill_partition(
    func: &WindowFunc,
    ordered: &[(usize, Vec<Value>)],
    rows: &[Row],
    labels: &[ColumnLabel],
    values: &mut [Value],
) -> Result<()> {
    match func {
        WindowFunc::RowNumber => {
            for (pos, (idx, _)) in ordered.iter().enumerate() {
                values[*idx] = Value::BigInt(pos as i64 + 1);
            }
        }
        WindowFunc::Rank => {
            let mut rank = 1i64;
            for (pos, (idx, keys)) in ordered.iter().enumerate() {
                values[*idx] = Value::BigInt(rank);
                if let Some((_, next_keys)) = ordered.get(pos + 1) {
                    if !keys_equal(keys, next_keys) {
                        rank = pos as i64 + 2;
                    }
                }
            }
        }
        WindowFunc::Lag { expr, offset } => {
            for (pos, (idx, _)) in ordered.iter().enumerate() {
                values[*idx] = match pos.checked_sub(*offset) {
                    Some(src) => evaluate(expr, rows[ordered[src].0].values(), labels)?,
                    None => Value::Null,
                };
            }
        }
        WindowFunc::Lead { expr, offset } => {
            for (pos, (idx, _)) in ordered.iter().enumerate() {
                values[*idx] = match ordered.get(pos + *offset) {
                    Some((src, _)) => evaluate(expr, rows[*src].values(), labels)?,
                    None => Value::Null,
                };
            }
        }
        WindowFunc::Aggregate { func, expr } => {
            let partition_rows: Vec<Row> =
                ordered.iter().map(|(i, _)| rows[*i].clone()).collect();
            let result = compute_aggregate(*func, Some(expr), &partition_rows, labels)?;
            for (idx, _) in ordered {
                values[*idx] = result.clone();
            }
        }
    }
    Ok(())
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.compare(y) == Some(Ordering::Equal) || (x.is_null() && y.is_null()))
}
