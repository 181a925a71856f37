//! Typed command model for ChalkDB
//!
//! Commands are validated values built by an external collaborator (a parser,
//! a test, an embedding application). The engine never executes free-form
//! text, which keeps it injection-safe by construction.

use std::sync::Arc;

use crate::catalog::{DataType, ForeignKeyDef, TriggerEvent, TriggerTiming};
use crate::storage::Value;
use crate::trigger::TriggerProcedure;

/// A command accepted by the execution engine
#[derive(Clone)]
pub enum Command {
    /// CREATE TABLE
    CreateTable {
        name: String,
        columns: Vec<ColumnSpec>,
        foreign_keys: Vec<ForeignKeyDef>,
        if_not_exists: bool,
    },
    /// DROP TABLE
    DropTable { name: String, if_exists: bool },
    /// CREATE INDEX
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        unique: bool,
    },
    /// DROP INDEX
    DropIndex { name: String },
    /// CREATE [MATERIALIZED] VIEW
    CreateView {
        name: String,
        query: SelectCommand,
        materialized: bool,
    },
    /// DROP VIEW
    DropView { name: String },
    /// CREATE TRIGGER
    CreateTrigger {
        name: String,
        table: String,
        event: TriggerEvent,
        timing: TriggerTiming,
        procedure: Arc<dyn TriggerProcedure>,
    },
    /// DROP TRIGGER
    DropTrigger { name: String },
    /// SELECT
    Select(SelectCommand),
    /// INSERT
    Insert(InsertCommand),
    /// UPDATE
    Update(UpdateCommand),
    /// DELETE
    Delete(DeleteCommand),
    /// MERGE
    Merge(MergeCommand),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::CreateTable { name, .. } => write!(f, "CreateTable({})", name),
            Command::DropTable { name, .. } => write!(f, "DropTable({})", name),
            Command::CreateIndex { name, .. } => write!(f, "CreateIndex({})", name),
            Command::DropIndex { name } => write!(f, "DropIndex({})", name),
            Command::CreateView { name, .. } => write!(f, "CreateView({})", name),
            Command::DropView { name } => write!(f, "DropView({})", name),
            Command::CreateTrigger { name, .. } => write!(f, "CreateTrigger({})", name),
            Command::DropTrigger { name } => write!(f, "DropTrigger({})", name),
            Command::Select(_) => write!(f, "Select"),
            Command::Insert(cmd) => write!(f, "Insert({})", cmd.table),
            Command::Update(cmd) => write!(f, "Update({})", cmd.table),
            Command::Delete(cmd) => write!(f, "Delete({})", cmd.table),
            Command::Merge(cmd) => write!(f, "Merge({})", cmd.target),
        }
    }
}

/// Column specification in CREATE TABLE
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub default: Option<Value>,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnSpec {
    /// A plain nullable column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            not_null: false,
            default: None,
            primary_key: false,
            unique: false,
        }
    }

    /// Mark as primary key
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    /// Mark NOT NULL
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Mark UNIQUE
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Attach a default value
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A table or view reference with an optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// The label rows from this source carry
    pub fn label(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Join kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

/// One join against the running source
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: TableRef,
    pub on: Expr,
}

/// SELECT command
#[derive(Debug, Clone, PartialEq)]
pub struct SelectCommand {
    /// DISTINCT flag
    pub distinct: bool,
    /// Select list
    pub items: Vec<SelectItem>,
    /// FROM source (None for constant selects)
    pub from: Option<TableRef>,
    /// JOIN clauses, applied in order
    pub joins: Vec<JoinClause>,
    /// WHERE clause
    pub filter: Option<Expr>,
    /// GROUP BY expressions
    pub group_by: Vec<Expr>,
    /// HAVING clause
    pub having: Option<Expr>,
    /// ORDER BY clause
    pub order_by: Vec<OrderByItem>,
    /// LIMIT
    pub limit: Option<usize>,
    /// OFFSET
    pub offset: Option<usize>,
}

impl Default for SelectCommand {
    fn default() -> Self {
        Self {
            distinct: false,
            items: Vec::new(),
            from: None,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

impl SelectCommand {
    /// `SELECT * FROM table`
    pub fn star(table: impl Into<String>) -> Self {
        Self {
            items: vec![SelectItem::Wildcard],
            from: Some(TableRef::new(table)),
            ..Self::default()
        }
    }
}

/// A single item in the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// All columns (*)
    Wildcard,
    /// An expression with optional alias
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// ORDER BY item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub ascending: bool,
}

impl OrderByItem {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: false,
        }
    }
}

/// Column reference, optionally qualified by table or alias
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Window functions
#[derive(Debug, Clone, PartialEq)]
pub enum WindowFunc {
    /// Sequential number within the partition
    RowNumber,
    /// Rank with gaps, by the window ORDER BY keys
    Rank,
    /// Value of an expression `offset` rows before the current row
    Lag { expr: Box<Expr>, offset: usize },
    /// Value of an expression `offset` rows after the current row
    Lead { expr: Box<Expr>, offset: usize },
    /// An aggregate computed over the whole partition
    Aggregate {
        func: AggregateFunc,
        expr: Box<Expr>,
    },
}

/// Window partition/order declaration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderByItem>,
}

/// An expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value
    Literal(Value),
    /// Column reference
    Column(ColumnRef),
    /// Binary operation
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// Unary operation
    UnaryOp { op: UnaryOperator, expr: Box<Expr> },
    /// IS NULL test
    IsNull(Box<Expr>),
    /// IS NOT NULL test
    IsNotNull(Box<Expr>),
    /// Scalar function call (UPPER, LOWER, LENGTH, ABS, COALESCE)
    Function { name: String, args: Vec<Expr> },
    /// Aggregate call; `arg = None` is COUNT(*)
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
    },
    /// Window function call
    Window { func: WindowFunc, over: WindowSpec },
}

impl Expr {
    /// Shorthand for an unqualified column reference
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: None,
            column: name.into(),
        })
    }

    /// Shorthand for a qualified column reference
    pub fn qcol(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: Some(table.into()),
            column: name.into(),
        })
    }

    /// Shorthand for a literal
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Build `self op other`
    pub fn binary(self, op: BinaryOperator, other: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    /// Build `self = other`
    pub fn eq(self, other: Expr) -> Self {
        self.binary(BinaryOperator::Eq, other)
    }

    /// Build `self AND other`
    pub fn and(self, other: Expr) -> Self {
        self.binary(BinaryOperator::And, other)
    }

    /// Does this expression contain an aggregate call (outside window calls)?
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Literal(_) | Expr::Column(_) => false,
            Expr::BinaryOp { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::UnaryOp { expr, .. } => expr.contains_aggregate(),
            Expr::IsNull(e) | Expr::IsNotNull(e) => e.contains_aggregate(),
            Expr::Function { args, .. } => args.iter().any(|a| a.contains_aggregate()),
            Expr::Window { .. } => false,
        }
    }

    /// Collect every distinct window call in this expression, in discovery
    /// order
    pub fn collect_windows<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Expr::Window { .. } => {
                if !out.iter().any(|w| *w == self) {
                    out.push(self);
                }
            }
            Expr::Literal(_) | Expr::Column(_) | Expr::Aggregate { .. } => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_windows(out);
                right.collect_windows(out);
            }
            Expr::UnaryOp { expr, .. } => expr.collect_windows(out),
            Expr::IsNull(e) | Expr::IsNotNull(e) => e.collect_windows(out),
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.collect_windows(out);
                }
            }
        }
    }
}

/// Column assignment in UPDATE and MERGE branches
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: Expr) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// INSERT command
#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub table: String,
    /// Target columns; None inserts in schema order
    pub columns: Option<Vec<String>>,
    /// One expression list per row
    pub rows: Vec<Vec<Expr>>,
}

impl InsertCommand {
    /// Insert literal rows in schema order
    pub fn values(table: impl Into<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            table: table.into(),
            columns: None,
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(Expr::Literal).collect())
                .collect(),
        }
    }
}

/// UPDATE command
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expr>,
}

/// DELETE command
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub table: String,
    pub filter: Option<Expr>,
}

/// MERGE join condition: target column matched against source column
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOn {
    pub target_column: String,
    pub source_column: String,
}

/// Action for WHEN MATCHED and WHEN NOT MATCHED BY SOURCE branches
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    /// Update the target row; assignments may reference target columns and,
    /// for the matched branch, source columns qualified by the source alias
    Update(Vec<Assignment>),
    /// Delete the target row
    Delete,
}

/// WHEN NOT MATCHED BY TARGET branch: insert a row built from the source row
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInsert {
    /// Target columns; None inserts in schema order
    pub columns: Option<Vec<String>>,
    /// Values evaluated against the source row
    pub values: Vec<Expr>,
}

/// MERGE command
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCommand {
    /// Target table
    pub target: String,
    /// Source row set
    pub source: SelectCommand,
    /// Label source columns carry inside branch expressions
    pub source_alias: String,
    /// Matching condition
    pub on: MergeOn,
    /// WHEN MATCHED
    pub when_matched: Option<MergeAction>,
    /// WHEN NOT MATCHED (BY TARGET)
    pub when_not_matched: Option<MergeInsert>,
    /// WHEN NOT MATCHED BY SOURCE, processed only after the other branches
    pub when_not_matched_by_source: Option<MergeAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_builders() {
        let expr = Expr::col("age").eq(Expr::lit(20));
        assert!(matches!(
            expr,
            Expr::BinaryOp {
                op: BinaryOperator::Eq,
                ..
            }
        ));
    }

    #[test]
    fn test_contains_aggregate() {
        let agg = Expr::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
        };
        assert!(agg.contains_aggregate());
        assert!(!Expr::col("x").contains_aggregate());

        let nested = Expr::col("x").binary(
            BinaryOperator::Add,
            Expr::Aggregate {
                func: AggregateFunc::Sum,
                arg: Some(Box::new(Expr::col("y"))),
            },
        );
        assert!(nested.contains_aggregate());
    }

    #[test]
    fn test_collect_windows_dedups() {
        let win = Expr::Window {
            func: WindowFunc::RowNumber,
            over: WindowSpec::default(),
        };
        let expr = win.clone().binary(BinaryOperator::Add, win.clone());
        let mut found = Vec::new();
        expr.collect_windows(&mut found);
        assert_eq!(found.len(), 1);
    }
}
