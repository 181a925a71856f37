use chalkdb::catalog::DataType;
use chalkdb::exec::command::{
    AggregateFunc, BinaryOperator, ColumnSpec, Command, Expr, InsertCommand, JoinClause, JoinType,
    OrderByItem, SelectCommand, SelectItem, TableRef, WindowFunc, WindowSpec,
};
use chalkdb::exec::ResultSet;
use chalkdb::storage::Value;
use chalkdb::Sandbox;

fn setup() -> Sandbox {
    let db = Sandbox::new();
    db.run(&Command::CreateTable {
        name: "students".to_string(),
        columns: vec![
            ColumnSpec::new("id", DataType::Integer).primary_key(),
            ColumnSpec::new("name", DataType::Text),
            ColumnSpec::new("dept", DataType::Text),
        ],
        foreign_keys: vec![],
        if_not_exists: false,
    })
    .unwrap();
    db.run(&Command::CreateTable {
        name: "grades".to_string(),
        columns: vec![
            ColumnSpec::new("id", DataType::Integer).primary_key(),
            ColumnSpec::new("student_id", DataType::Integer),
            ColumnSpec::new("score", DataType::Integer),
        ],
        foreign_keys: vec![],
        if_not_exists: false,
    })
    .unwrap();

    db.run(&Command::Insert(InsertCommand::values(
        "students",
        vec![
            vec![Value::Integer(1), "Alice".into(), "math".into()],
            vec![Value::Integer(2), "Bob".into(), "math".into()],
            vec![Value::Integer(3), "Carol".into(), "physics".into()],
        ],
    )))
    .unwrap();
    db.run(&Command::Insert(InsertCommand::values(
        "grades",
        vec![
            vec![Value::Integer(1), Value::Integer(1), Value::Integer(90)],
            vec![Value::Integer(2), Value::Integer(1), Value::Integer(70)],
            vec![Value::Integer(3), Value::Integer(2), Value::Integer(85)],
        ],
    )))
    .unwrap();
    db
}

fn query(db: &Sandbox, select: SelectCommand) -> ResultSet {
    db.run(&Command::Select(select))
        .unwrap()
        .rows()
        .unwrap()
        .clone()
}

#[test]
fn test_inner_join_matches_only() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::qcol("students", "name")),
                SelectItem::expr(Expr::qcol("g", "score")),
            ],
            from: Some(TableRef::new("students")),
            joins: vec![JoinClause {
                join_type: JoinType::Inner,
                table: TableRef::aliased("grades", "g"),
                on: Expr::qcol("students", "id").eq(Expr::qcol("g", "student_id")),
            }],
            order_by: vec![OrderByItem::asc(Expr::qcol("g", "score"))],
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.columns, vec!["name", "score"]);
    assert_eq!(result.rows.len(), 3);
    // Carol has no grades and does not appear
    assert!(result
        .rows
        .iter()
        .all(|r| r.get(0) != Some(&Value::String("Carol".to_string()))));
    assert_eq!(result.rows[0].get(1), Some(&Value::Integer(70)));
}

#[test]
fn test_left_join_pads_with_nulls() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::qcol("students", "name")),
                SelectItem::expr(Expr::qcol("g", "score")),
            ],
            from: Some(TableRef::new("students")),
            joins: vec![JoinClause {
                join_type: JoinType::Left,
                table: TableRef::aliased("grades", "g"),
                on: Expr::qcol("students", "id").eq(Expr::qcol("g", "student_id")),
            }],
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.rows.len(), 4);
    let carol = result
        .rows
        .iter()
        .find(|r| r.get(0) == Some(&Value::String("Carol".to_string())))
        .unwrap();
    assert_eq!(carol.get(1), Some(&Value::Null));
}

#[test]
fn test_group_by_with_having() {
    let db = setup();
    let count = Expr::Aggregate {
        func: AggregateFunc::Count,
        arg: None,
    };
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::col("dept")),
                SelectItem::aliased(count.clone(), "n"),
            ],
            from: Some(TableRef::new("students")),
            group_by: vec![Expr::col("dept")],
            having: Some(count.binary(BinaryOperator::Gt, Expr::lit(1i64))),
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.columns, vec!["dept", "n"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get(0), Some(&Value::String("math".to_string())));
    assert_eq!(result.rows[0].get(1), Some(&Value::BigInt(2)));
}

#[test]
fn test_aggregates_over_empty_input_yield_one_row() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::Aggregate {
                    func: AggregateFunc::Count,
                    arg: None,
                }),
                SelectItem::expr(Expr::Aggregate {
                    func: AggregateFunc::Sum,
                    arg: Some(Box::new(Expr::col("score"))),
                }),
            ],
            from: Some(TableRef::new("grades")),
            filter: Some(Expr::col("score").binary(BinaryOperator::Gt, Expr::lit(1000))),
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get(0), Some(&Value::BigInt(0)));
    assert_eq!(result.rows[0].get(1), Some(&Value::Null));
}

#[test]
fn test_order_limit_offset() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            items: vec![SelectItem::expr(Expr::col("score"))],
            from: Some(TableRef::new("grades")),
            order_by: vec![OrderByItem::desc(Expr::col("score"))],
            limit: Some(2),
            offset: Some(1),
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get(0), Some(&Value::Integer(85)));
    assert_eq!(result.rows[1].get(0), Some(&Value::Integer(70)));
}

#[test]
fn test_distinct_dedupes_output_rows() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            distinct: true,
            items: vec![SelectItem::expr(Expr::col("dept"))],
            from: Some(TableRef::new("students")),
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.rows.len(), 2);
}

#[test]
fn test_scalar_functions() {
    let db = setup();
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::Function {
                    name: "UPPER".to_string(),
                    args: vec![Expr::col("name")],
                }),
                SelectItem::expr(Expr::Function {
                    name: "COALESCE".to_string(),
                    args: vec![Expr::Literal(Value::Null), Expr::lit(7)],
                }),
            ],
            from: Some(TableRef::new("students")),
            filter: Some(Expr::col("id").eq(Expr::lit(1))),
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.rows[0].get(0), Some(&Value::String("ALICE".to_string())));
    assert_eq!(result.rows[0].get(1), Some(&Value::Integer(7)));
}

#[test]
fn test_window_row_number_and_rank() {
    let db = setup();
    let over = WindowSpec {
        partition_by: vec![Expr::col("student_id")],
        order_by: vec![OrderByItem::desc(Expr::col("score"))],
    };
    let result = query(
        &db,
        SelectCommand {
            items: vec![
                SelectItem::expr(Expr::col("id")),
                SelectItem::aliased(
                    Expr::Window {
                        func: WindowFunc::RowNumber,
                        over: over.clone(),
                    },
                    "rn",
                ),
                SelectItem::aliased(
                    Expr::Window {
                        func: WindowFunc::Lag {
                            expr: Box::new(Expr::col("score")),
                            offset: 1,
                        },
                        over,
                    },
                    "prev",
                ),
            ],
            from: Some(TableRef::new("grades")),
            order_by: vec![OrderByItem::asc(Expr::col("id"))],
            ..SelectCommand::default()
        },
    );
    assert_eq!(result.columns, vec!["id", "rn", "prev"]);
    // Alice's grades: 90 (rn 1), 70 (rn 2, lag 90). Bob's 85 stands alone.
    assert_eq!(result.rows[0].get(1), Some(&Value::BigInt(1)));
    assert_eq!(result.rows[0].get(2), Some(&Value::Null));
    assert_eq!(result.rows[1].get(1), Some(&Value::BigInt(2)));
    assert_eq!(result.rows[1].get(2), Some(&Value::Integer(90)));
    assert_eq!(result.rows[2].get(1), Some(&Value::BigInt(1)));
}

#[test]
fn test_plain_view_reflects_base_table() {
    let db = setup();
    db.run(&Command::CreateView {
        name: "math_students".to_string(),
        query: SelectCommand {
            items: vec![SelectItem::expr(Expr::col("name"))],
            from: Some(TableRef::new("students")),
            filter: Some(Expr::col("dept").eq(Expr::lit("math"))),
            ..SelectCommand::default()
        },
        materialized: false,
    })
    .unwrap();

    let result = query(&db, SelectCommand::star("math_students"));
    assert_eq!(result.rows.len(), 2);

    db.run(&Command::Insert(InsertCommand::values(
        "students",
        vec![vec![Value::Integer(4), "Dave".into(), "math".into()]],
    )))
    .unwrap();
    let result = query(&db, SelectCommand::star("math_students"));
    assert_eq!(result.rows.len(), 3);
}

#[test]
fn test_materialized_view_cache_tracks_base_versions() {
    let db = setup();
    db.run(&Command::CreateView {
        name: "dept_sizes".to_string(),
        query: SelectCommand {
            items: vec![
                SelectItem::expr(Expr::col("dept")),
                SelectItem::aliased(
                    Expr::Aggregate {
                        func: AggregateFunc::Count,
                        arg: None,
                    },
                    "n",
                ),
            ],
            from: Some(TableRef::new("students")),
            group_by: vec![Expr::col("dept")],
            ..SelectCommand::default()
        },
        materialized: true,
    })
    .unwrap();

    let before = query(&db, SelectCommand::star("dept_sizes"));
    assert_eq!(before.rows.len(), 2);

    // A committed base mutation invalidates the cached rows
    db.run(&Command::Insert(InsertCommand::values(
        "students",
        vec![vec![Value::Integer(4), "Dave".into(), "chem".into()]],
    )))
    .unwrap();

    let after = query(&db, SelectCommand::star("dept_sizes"));
    assert_eq!(after.rows.len(), 3);
}
