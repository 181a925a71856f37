use chalkdb::catalog::DataType;
use chalkdb::exec::command::{ColumnSpec, Command, InsertCommand, SelectCommand};
use chalkdb::storage::Value;
use chalkdb::Sandbox;

#[test]
fn test_catalog_dump_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.json");
    let path = path.to_str().unwrap();

    {
        let db = Sandbox::new();
        db.run(&Command::CreateTable {
            name: "students".to_string(),
            columns: vec![
                ColumnSpec::new("id", DataType::Integer).primary_key(),
                ColumnSpec::new("name", DataType::Varchar(64)).not_null(),
                ColumnSpec::new("year", DataType::Integer).default(Value::Integer(1)),
            ],
            foreign_keys: vec![],
            if_not_exists: false,
        })
        .unwrap();
        db.run(&Command::CreateIndex {
            name: "idx_students_name".to_string(),
            table: "students".to_string(),
            columns: vec!["name".to_string()],
            unique: false,
        })
        .unwrap();
        db.save_catalog(path).unwrap();
    }

    let restored = Sandbox::load_catalog(path).unwrap();
    let snapshot = restored.catalog().snapshot();

    let table = snapshot.get_table("students").unwrap();
    assert_eq!(table.schema().column_count(), 3);
    let name = table.get_column("name").unwrap();
    assert!(!name.nullable);
    assert_eq!(name.data_type, DataType::Varchar(64));
    let year = table.get_column("year").unwrap();
    assert_eq!(year.default, Some(Value::Integer(1)));

    let index = snapshot.get_index("idx_students_name").unwrap();
    assert_eq!(index.table_name, "students");

    // Row data does not persist, but the restored schema is usable
    db_roundtrip(&restored);
}

fn db_roundtrip(db: &Sandbox) {
    db.run(&Command::Insert(InsertCommand {
        table: "students".to_string(),
        columns: Some(vec!["id".to_string(), "name".to_string()]),
        rows: vec![vec![
            chalkdb::exec::command::Expr::lit(1),
            chalkdb::exec::command::Expr::lit("Alice"),
        ]],
    }))
    .unwrap();

    let outcome = db
        .run(&Command::Select(SelectCommand::star("students")))
        .unwrap();
    let rows = &outcome.rows().unwrap().rows;
    assert_eq!(rows.len(), 1);
    // The omitted column took its declared default
    assert_eq!(rows[0].get(2), Some(&Value::Integer(1)));
}
