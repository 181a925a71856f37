//! Expression evaluation for ChalkDB
//!
//! Evaluates typed expressions against a row with labeled columns. Aggregate
//! calls need a group of rows in scope; window calls need precomputed
//! per-row values supplied by the SELECT pipeline.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::exec::command::{AggregateFunc, BinaryOperator, ColumnRef, Expr, UnaryOperator};
use crate::storage::{Row, Value};

/// A column label: optional source qualifier (table name or alias) plus the
/// column name
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLabel {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnLabel {
    pub fn new(qualifier: Option<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier,
            name: name.into(),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }
}

/// Resolve a column reference against a label list. Qualified references
/// must match the qualifier; unqualified references must be unambiguous.
pub fn resolve_column(labels: &[ColumnLabel], col: &ColumnRef) -> Result<usize> {
    let mut found = None;
    for (i, label) in labels.iter().enumerate() {
        if label.name != col.column {
            continue;
        }
        if let Some(qualifier) = &col.table {
            if label.qualifier.as_deref() != Some(qualifier.as_str()) {
                continue;
            }
        }
        if found.is_some() && col.table.is_none() {
            return Err(Error::ExecutionError(format!(
                "ambiguous column reference '{}'",
                col.column
            )));
        }
        found = Some(i);
        if col.table.is_some() {
            break;
        }
    }
    found.ok_or_else(|| {
        Error::ColumnNotFound(
            col.column.clone(),
            col.table.clone().unwrap_or_default(),
        )
    })
}

/// Everything an evaluation may need beyond the current row
#[derive(Clone, Copy, Default)]
pub struct EvalScope<'a> {
    /// Rows of the current group, for aggregate calls
    pub group: Option<&'a [Row]>,
    /// Precomputed window values and the current row's index
    pub windows: Option<(&'a [(&'a Expr, Vec<Value>)], usize)>,
}

/// Evaluate an expression against one row
pub fn evaluate(expr: &Expr, row: &[Value], labels: &[ColumnLabel]) -> Result<Value> {
    evaluate_scoped(expr, row, labels, EvalScope::default())
}

/// Evaluate an expression with aggregate/window support
pub fn evaluate_scoped(
    expr: &Expr,
    row: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        Expr::Column(col) => {
            let idx = resolve_column(labels, col)?;
            row.get(idx).cloned().ok_or_else(|| {
                Error::ExecutionError(format!("column index {} out of bounds", idx))
            })
        }

        Expr::BinaryOp { left, op, right } => {
            let left_val = evaluate_scoped(left, row, labels, scope)?;
            let right_val = evaluate_scoped(right, row, labels, scope)?;
            evaluate_binary_op(&left_val, *op, &right_val)
        }

        Expr::UnaryOp { op, expr } => {
            let val = evaluate_scoped(expr, row, labels, scope)?;
            evaluate_unary_op(*op, &val)
        }

        Expr::IsNull(inner) => {
            let val = evaluate_scoped(inner, row, labels, scope)?;
            Ok(Value::Boolean(val.is_null()))
        }

        Expr::IsNotNull(inner) => {
            let val = evaluate_scoped(inner, row, labels, scope)?;
            Ok(Value::Boolean(!val.is_null()))
        }

        Expr::Function { name, args } => evaluate_function(name, args, row, labels, scope),

        Expr::Aggregate { func, arg } => {
            let group = scope.group.ok_or_else(|| {
                Error::ExecutionError(format!("{:?} used outside a grouped context", func))
            })?;
            compute_aggregate(*func, arg.as_deref(), group, labels)
        }

        Expr::Window { .. } => {
            let (windows, row_index) = scope.windows.ok_or_else(|| {
                Error::ExecutionError("window function used outside a SELECT list".to_string())
            })?;
            windows
                .iter()
                .find(|(w, _)| *w == expr)
                .map(|(_, values)| values[row_index].clone())
                .ok_or_else(|| Error::Internal("window values not computed".to_string()))
        }
    }
}

/// Evaluate a predicate; NULL and non-boolean results count as false
pub fn evaluate_predicate(
    expr: &Expr,
    row: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<bool> {
    Ok(evaluate_scoped(expr, row, labels, scope)?
        .as_bool()
        .unwrap_or(false))
}

fn evaluate_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> Result<Value> {
    match op {
        BinaryOperator::Eq => Ok(Value::Boolean(
            left.compare(right) == Some(Ordering::Equal),
        )),
        BinaryOperator::Neq => Ok(Value::Boolean(
            left.compare(right) != Some(Ordering::Equal),
        )),
        BinaryOperator::Lt => Ok(Value::Boolean(left.compare(right) == Some(Ordering::Less))),
        BinaryOperator::Gt => Ok(Value::Boolean(
            left.compare(right) == Some(Ordering::Greater),
        )),
        BinaryOperator::Lte => Ok(Value::Boolean(matches!(
            left.compare(right),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ))),
        BinaryOperator::Gte => Ok(Value::Boolean(matches!(
            left.compare(right),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ))),
        BinaryOperator::And => Ok(Value::Boolean(
            left.as_bool().unwrap_or(false) && right.as_bool().unwrap_or(false),
        )),
        BinaryOperator::Or => Ok(Value::Boolean(
            left.as_bool().unwrap_or(false) || right.as_bool().unwrap_or(false),
        )),
        BinaryOperator::Add => left.add(right).ok_or_else(|| type_mismatch(left, right)),
        BinaryOperator::Sub => left.sub(right).ok_or_else(|| type_mismatch(left, right)),
        BinaryOperator::Mul => left.mul(right).ok_or_else(|| type_mismatch(left, right)),
        BinaryOperator::Div => {
            if right.as_f64() == Some(0.0) {
                return Err(Error::DivisionByZero);
            }
            left.div(right).ok_or_else(|| type_mismatch(left, right))
        }
        BinaryOperator::Concat => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            _ => Ok(Value::String(format!("{}{}", left, right))),
        },
    }
}

fn type_mismatch(left: &Value, right: &Value) -> Error {
    Error::TypeMismatch {
        from: left.type_name().to_string(),
        to: right.type_name().to_string(),
    }
}

fn evaluate_unary_op(op: UnaryOperator, val: &Value) -> Result<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Boolean(!val.as_bool().unwrap_or(false))),
        UnaryOperator::Minus => match val {
            Value::Null => Ok(Value::Null),
            Value::Integer(i) => Ok(Value::Integer(-i)),
            Value::BigInt(i) => Ok(Value::BigInt(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(Error::TypeMismatch {
                from: val.type_name().to_string(),
                to: "numeric".to_string(),
            }),
        },
        UnaryOperator::Plus => Ok(val.clone()),
    }
}

fn evaluate_function(
    name: &str,
    args: &[Expr],
    row: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<Value> {
    let name_upper = name.to_uppercase();
    match name_upper.as_str() {
        "UPPER" => {
            let val = single_arg(&name_upper, args, row, labels, scope)?;
            match val {
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                Value::Null => Ok(Value::Null),
                other => Ok(other),
            }
        }
        "LOWER" => {
            let val = single_arg(&name_upper, args, row, labels, scope)?;
            match val {
                Value::String(s) => Ok(Value::String(s.to_lowercase())),
                Value::Null => Ok(Value::Null),
                other => Ok(other),
            }
        }
        "LENGTH" => {
            let val = single_arg(&name_upper, args, row, labels, scope)?;
            match val {
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i32)),
                Value::Null => Ok(Value::Null),
                other => Err(Error::TypeMismatch {
                    from: other.type_name().to_string(),
                    to: "STRING".to_string(),
                }),
            }
        }
        "ABS" => {
            let val = single_arg(&name_upper, args, row, labels, scope)?;
            match val {
                Value::Integer(i) => Ok(Value::Integer(i.abs())),
                Value::BigInt(i) => Ok(Value::BigInt(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Null => Ok(Value::Null),
                other => Err(Error::TypeMismatch {
                    from: other.type_name().to_string(),
                    to: "numeric".to_string(),
                }),
            }
        }
        "COALESCE" => {
            for arg in args {
                let val = evaluate_scoped(arg, row, labels, scope)?;
                if !val.is_null() {
                    return Ok(val);
                }
            }
            Ok(Value::Null)
        }
        _ => Err(Error::ExecutionError(format!("unknown function: {}", name))),
    }
}

fn single_arg(
    name: &str,
    args: &[Expr],
    row: &[Value],
    labels: &[ColumnLabel],
    scope: EvalScope<'_>,
) -> Result<Value> {
    let arg = args
        .first()
        .ok_or_else(|| Error::ExecutionError(format!("{} takes one argument", name)))?;
    evaluate_scoped(arg, row, labels, scope)
}

/// Compute an aggregate over a group of rows. `arg = None` is COUNT(*).
pub fn compute_aggregate(
    func: AggregateFunc,
    arg: Option<&Expr>,
    rows: &[Row],
    labels: &[ColumnLabel],
) -> Result<Value> {
    let values: Vec<Value> = match arg {
        None => {
            if func != AggregateFunc::Count {
                return Err(Error::ExecutionError(format!(
                    "{:?} requires an argument",
                    func
                )));
            }
            return Ok(Value::BigInt(rows.len() as i64));
        }
        Some(expr) => rows
            .iter()
            .map(|row| evaluate(expr, row.values(), labels))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|v| !v.is_null())
            .collect(),
    };

    match func {
        AggregateFunc::Count => Ok(Value::BigInt(values.len() as i64)),
        AggregateFunc::Sum => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut acc = values[0].clone();
            for value in &values[1..] {
                acc = acc.add(value).ok_or_else(|| type_mismatch(&acc, value))?;
            }
            Ok(acc)
        }
        AggregateFunc::Avg => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut sum = 0.0;
            for value in &values {
                sum += value.as_f64().ok_or_else(|| Error::TypeMismatch {
                    from: value.type_name().to_string(),
                    to: "numeric".to_string(),
                })?;
            }
            Ok(Value::Float(sum / values.len() as f64))
        }
        AggregateFunc::Min => Ok(values
            .into_iter()
            .reduce(|a, b| {
                if b.compare(&a) == Some(Ordering::Less) {
                    b
                } else {
                    a
                }
            })
            .unwrap_or(Value::Null)),
        AggregateFunc::Max => Ok(values
            .into_iter()
            .reduce(|a, b| {
                if b.compare(&a) == Some(Ordering::Greater) {
                    b
                } else {
                    a
                }
            })
            .unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<ColumnLabel> {
        vec![
            ColumnLabel::new(Some("t".to_string()), "id"),
            ColumnLabel::new(Some("t".to_string()), "name"),
        ]
    }

    #[test]
    fn test_column_resolution() {
        let labels = labels();
        let idx = resolve_column(
            &labels,
            &ColumnRef {
                table: None,
                column: "name".to_string(),
            },
        )
        .unwrap();
        assert_eq!(idx, 1);

        let idx = resolve_column(
            &labels,
            &ColumnRef {
                table: Some("t".to_string()),
                column: "id".to_string(),
            },
        )
        .unwrap();
        assert_eq!(idx, 0);

        assert!(resolve_column(
            &labels,
            &ColumnRef {
                table: None,
                column: "missing".to_string(),
            },
        )
        .is_err());
    }

    #[test]
    fn test_ambiguous_column_is_rejected() {
        let labels = vec![
            ColumnLabel::new(Some("a".to_string()), "id"),
            ColumnLabel::new(Some("b".to_string()), "id"),
        ];
        let err = resolve_column(
            &labels,
            &ColumnRef {
                table: None,
                column: "id".to_string(),
            },
        );
        assert!(matches!(err, Err(Error::ExecutionError(_))));
    }

    #[test]
    fn test_binary_eval() {
        let labels = labels();
        let row = vec![Value::Integer(3), Value::String("x".to_string())];
        let expr = Expr::col("id").binary(BinaryOperator::Add, Expr::lit(4));
        assert_eq!(evaluate(&expr, &row, &labels).unwrap(), Value::Integer(7));

        let expr = Expr::lit(1).binary(BinaryOperator::Div, Expr::lit(0));
        assert!(matches!(
            evaluate(&expr, &row, &labels),
            Err(Error::DivisionByZero)
        ));
    }

    #[test]
    fn test_aggregates() {
        let labels = vec![ColumnLabel::bare("v")];
        let rows = vec![
            Row::new(vec![Value::Integer(1)]),
            Row::new(vec![Value::Integer(2)]),
            Row::new(vec![Value::Null]),
            Row::new(vec![Value::Integer(3)]),
        ];

        let col = Expr::col("v");
        assert_eq!(
            compute_aggregate(AggregateFunc::Count, None, &rows, &labels).unwrap(),
            Value::BigInt(4)
        );
        assert_eq!(
            compute_aggregate(AggregateFunc::Count, Some(&col), &rows, &labels).unwrap(),
            Value::BigInt(3)
        );
        assert_eq!(
            compute_aggregate(AggregateFunc::Sum, Some(&col), &rows, &labels).unwrap(),
            Value::Integer(6)
        );
        assert_eq!(
            compute_aggregate(AggregateFunc::Avg, Some(&col), &rows, &labels).unwrap(),
            Value::Float(2.0)
        );
        assert_eq!(
            compute_aggregate(AggregateFunc::Min, Some(&col), &rows, &labels).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            compute_aggregate(AggregateFunc::Max, Some(&col), &rows, &labels).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_coalesce() {
        let labels = labels();
        let row = vec![Value::Null, Value::String("fallback".to_string())];
        let expr = Expr::Function {
            name: "COALESCE".to_string(),
            args: vec![Expr::col("id"), Expr::col("name")],
        };
        assert_eq!(
            evaluate(&expr, &row, &labels).unwrap(),
            Value::String("fallback".to_string())
        );
    }
}
