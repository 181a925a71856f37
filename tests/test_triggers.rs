use std::sync::Arc;

use chalkdb::catalog::{DataType, TriggerEvent, TriggerTiming};
use chalkdb::exec::command::{
    Assignment, ColumnSpec, Command, Expr, InsertCommand, SelectCommand, UpdateCommand,
    DeleteCommand,
};
use chalkdb::storage::Value;
use chalkdb::transaction::TransactionState;
use chalkdb::trigger::{TriggerContext, TriggerProcedure};
use chalkdb::{Error, Sandbox};

fn create_table(db: &Sandbox, name: &str, columns: Vec<ColumnSpec>) {
    db.run(&Command::CreateTable {
        name: name.to_string(),
        columns,
        foreign_keys: vec![],
        if_not_exists: false,
    })
    .unwrap();
}

fn create_trigger(
    db: &Sandbox,
    name: &str,
    table: &str,
    event: TriggerEvent,
    timing: TriggerTiming,
    procedure: Arc<dyn TriggerProcedure>,
) {
    db.run(&Command::CreateTrigger {
        name: name.to_string(),
        table: table.to_string(),
        event,
        timing,
        procedure,
    })
    .unwrap();
}

fn count(db: &Sandbox, table: &str) -> usize {
    db.run(&Command::Select(SelectCommand::star(table)))
        .unwrap()
        .rows()
        .unwrap()
        .row_count()
}

#[test]
fn test_after_insert_trigger_writes_one_audit_row_per_insert() {
    let db = Sandbox::new();
    create_table(
        &db,
        "orders",
        vec![
            ColumnSpec::new("id", DataType::Integer).primary_key(),
            ColumnSpec::new("item", DataType::Text),
        ],
    );
    create_table(
        &db,
        "audit",
        vec![
            ColumnSpec::new("order_id", DataType::Integer),
            ColumnSpec::new("action", DataType::Text),
        ],
    );

    let procedure: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let new = ctx.new.ok_or_else(|| Error::Internal("no new row".into()))?;
        let order_id = new.get(0).cloned().unwrap_or(Value::Null);
        ctx.execute(&Command::Insert(InsertCommand::values(
            "audit",
            vec![vec![order_id, Value::String("inserted".to_string())]],
        )))?;
        Ok(())
    });
    create_trigger(
        &db,
        "audit_orders",
        "orders",
        TriggerEvent::Insert,
        TriggerTiming::After,
        procedure,
    );

    let mut txn = db.begin();
    for i in 1..=3 {
        db.execute(
            &Command::Insert(InsertCommand::values(
                "orders",
                vec![vec![Value::Integer(i), Value::String(format!("item-{}", i))]],
            )),
            &mut txn,
        )
        .unwrap();
    }
    // Trigger output commits with the rest of the transaction
    assert_eq!(count(&db, "audit"), 0);
    db.commit(&mut txn).unwrap();

    assert_eq!(count(&db, "orders"), 3);
    assert_eq!(count(&db, "audit"), 3);
}

#[test]
fn test_after_update_trigger_sees_old_and_new_values() {
    let db = Sandbox::new();
    create_table(
        &db,
        "students",
        vec![
            ColumnSpec::new("id", DataType::Integer).primary_key(),
            ColumnSpec::new("name", DataType::Text),
        ],
    );
    create_table(
        &db,
        "name_changes",
        vec![
            ColumnSpec::new("student_id", DataType::Integer),
            ColumnSpec::new("old_name", DataType::Text),
            ColumnSpec::new("new_name", DataType::Text),
        ],
    );
    db.run(&Command::Insert(InsertCommand::values(
        "students",
        vec![vec![Value::Integer(1), Value::String("Alice".to_string())]],
    )))
    .unwrap();

    let procedure: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let old = ctx.old.ok_or_else(|| Error::Internal("no old row".into()))?;
        let new = ctx.new.ok_or_else(|| Error::Internal("no new row".into()))?;
        ctx.execute(&Command::Insert(InsertCommand::values(
            "name_changes",
            vec![vec![
                new.get(0).cloned().unwrap_or(Value::Null),
                old.get(1).cloned().unwrap_or(Value::Null),
                new.get(1).cloned().unwrap_or(Value::Null),
            ]],
        )))?;
        Ok(())
    });
    create_trigger(
        &db,
        "log_name_changes",
        "students",
        TriggerEvent::Update,
        TriggerTiming::After,
        procedure,
    );

    db.run(&Command::Update(UpdateCommand {
        table: "students".to_string(),
        assignments: vec![Assignment::new("name", Expr::lit("Alicia"))],
        filter: Some(Expr::col("id").eq(Expr::lit(1))),
    }))
    .unwrap();

    let audit = db
        .run(&Command::Select(SelectCommand::star("name_changes")))
        .unwrap();
    let rows = &audit.rows().unwrap().rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Integer(1)));
    assert_eq!(rows[0].get(1), Some(&Value::String("Alice".to_string())));
    assert_eq!(rows[0].get(2), Some(&Value::String("Alicia".to_string())));
}

#[test]
fn test_before_trigger_veto_rewinds_whole_statement() {
    let db = Sandbox::new();
    create_table(
        &db,
        "accounts",
        vec![
            ColumnSpec::new("id", DataType::Integer).primary_key(),
            ColumnSpec::new("balance", DataType::Integer),
        ],
    );
    db.run(&Command::Insert(InsertCommand::values(
        "accounts",
        vec![
            vec![Value::Integer(1), Value::Integer(0)],
            vec![Value::Integer(2), Value::Integer(500)],
        ],
    )))
    .unwrap();

    let procedure: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let old = ctx.old.ok_or_else(|| Error::Internal("no old row".into()))?;
        if old.get(1) != Some(&Value::Integer(0)) {
            return Err(ctx.veto("account still holds funds"));
        }
        Ok(())
    });
    create_trigger(
        &db,
        "protect_funded_accounts",
        "accounts",
        TriggerEvent::Delete,
        TriggerTiming::Before,
        procedure,
    );

    let mut txn = db.begin();
    // Deletes account 1 fine, then account 2 is vetoed; the whole
    // statement rewinds, including the first delete.
    let err = db.execute(
        &Command::Delete(DeleteCommand {
            table: "accounts".to_string(),
            filter: None,
        }),
        &mut txn,
    );
    assert!(matches!(err, Err(Error::Veto { .. })));
    assert!(txn.is_active());

    // The transaction stays usable for a permitted statement
    db.execute(
        &Command::Delete(DeleteCommand {
            table: "accounts".to_string(),
            filter: Some(Expr::col("id").eq(Expr::lit(1))),
        }),
        &mut txn,
    )
    .unwrap();
    db.commit(&mut txn).unwrap();

    assert_eq!(count(&db, "accounts"), 1);
}

#[test]
fn test_trigger_recursion_limit_aborts_transaction() {
    let db = Sandbox::new();
    create_table(
        &db,
        "events",
        vec![ColumnSpec::new("seq", DataType::Integer).primary_key()],
    );

    // Each insert triggers another insert into the same table
    let procedure: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let new = ctx.new.ok_or_else(|| Error::Internal("no new row".into()))?;
        let next = match new.get(0) {
            Some(Value::Integer(n)) => Value::Integer(n + 1),
            _ => Value::Integer(0),
        };
        ctx.execute(&Command::Insert(InsertCommand::values(
            "events",
            vec![vec![next]],
        )))?;
        Ok(())
    });
    create_trigger(
        &db,
        "cascade_events",
        "events",
        TriggerEvent::Insert,
        TriggerTiming::After,
        procedure,
    );

    let mut txn = db.begin();
    let err = db.execute(
        &Command::Insert(InsertCommand::values(
            "events",
            vec![vec![Value::Integer(1)]],
        )),
        &mut txn,
    );
    assert!(matches!(err, Err(Error::TriggerRecursion(_))));
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert_eq!(count(&db, "events"), 0);
}

#[test]
fn test_nested_triggers_within_depth_limit() {
    let db = Sandbox::new();
    for name in ["t1", "t2", "t3"] {
        create_table(
            &db,
            name,
            vec![ColumnSpec::new("id", DataType::Integer).primary_key()],
        );
    }

    let into_t2: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let id = ctx.new.and_then(|r| r.get(0).cloned()).unwrap_or(Value::Null);
        ctx.execute(&Command::Insert(InsertCommand::values("t2", vec![vec![id]])))?;
        Ok(())
    });
    let into_t3: Arc<dyn TriggerProcedure> = Arc::new(|ctx: &mut TriggerContext<'_>| {
        let id = ctx.new.and_then(|r| r.get(0).cloned()).unwrap_or(Value::Null);
        ctx.execute(&Command::Insert(InsertCommand::values("t3", vec![vec![id]])))?;
        Ok(())
    });
    create_trigger(&db, "fan_t2", "t1", TriggerEvent::Insert, TriggerTiming::After, into_t2);
    create_trigger(&db, "fan_t3", "t2", TriggerEvent::Insert, TriggerTiming::After, into_t3);

    db.run(&Command::Insert(InsertCommand::values(
        "t1",
        vec![vec![Value::Integer(7)]],
    )))
    .unwrap();

    assert_eq!(count(&db, "t1"), 1);
    assert_eq!(count(&db, "t2"), 1);
    assert_eq!(count(&db, "t3"), 1);
}

#[test]
fn test_dropped_trigger_stops_firing() {
    let db = Sandbox::new();
    create_table(
        &db,
        "items",
        vec![ColumnSpec::new("id", DataType::Integer).primary_key()],
    );

    let procedure: Arc<dyn TriggerProcedure> =
        Arc::new(|ctx: &mut TriggerContext<'_>| Err(ctx.veto("read only")));
    create_trigger(
        &db,
        "freeze_items",
        "items",
        TriggerEvent::Insert,
        TriggerTiming::Before,
        procedure,
    );

    let insert = Command::Insert(InsertCommand::values(
        "items",
        vec![vec![Value::Integer(1)]],
    ));
    assert!(matches!(db.run(&insert), Err(Error::Veto { .. })));

    db.run(&Command::DropTrigger {
        name: "freeze_items".to_string(),
    })
    .unwrap();
    db.run(&insert).unwrap();
    assert_eq!(count(&db, "items"), 1);
}
