use asupersync::runtime::RuntimeBuilder;
use std::sync::Arc;

use sqlwrite::prelude::*;
use sqlwrite::{
    CustomMode, CustomOperation, FieldContext, FieldStrategy, FlushReport, MemoryConnection,
    MemoryDatabase, RowSink,
};

const HERO: ClassId = ClassId::new(0);
const FLYER: ClassId = ClassId::new(1);
const SIDEKICK: ClassId = ClassId::new(2);
const VILLAIN: ClassId = ClassId::new(3);

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Records villain inserts in `audit` and purges the entries on delete.
#[derive(Debug)]
struct AuditTrail;

impl AuditTrail {
    fn entry(ctx: &FieldContext<'_>) -> Result<Value> {
        ctx.value.as_value().cloned().ok_or_else(|| {
            Error::user(ctx.object.id(), Some(&ctx.field.name), "audit entry must be a value")
        })
    }
}

impl FieldStrategy for AuditTrail {
    fn custom_insert(&self, _ctx: &FieldContext<'_>) -> CustomMode {
        CustomMode::Custom
    }

    fn custom_operation(
        &self,
        action: Action,
        ctx: &FieldContext<'_>,
    ) -> Result<Option<CustomOperation>> {
        if action != Action::Insert {
            return Ok(None);
        }
        Ok(Some(CustomOperation::Statement {
            sql: "INSERT INTO \"audit\" (\"entry\") VALUES ($1)".to_string(),
            params: vec![Self::entry(ctx)?],
        }))
    }

    fn contribute_insert(&self, _ctx: &FieldContext<'_>, _sink: &mut dyn RowSink) -> Result<()> {
        Ok(())
    }

    fn contribute_update(&self, _ctx: &FieldContext<'_>, _sink: &mut dyn RowSink) -> Result<()> {
        Ok(())
    }

    fn contribute_delete(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()> {
        let audit = ctx
            .mapping
            .table_by_name("audit")
            .ok_or_else(|| Error::user(ctx.object.id(), None, "audit table is not mapped"))?;
        sink.all_rows(
            audit,
            Action::Delete,
            Vec::new(),
            vec![("entry".to_string(), Self::entry(ctx)?)],
        );
        Ok(())
    }
}

fn mapping() -> Mapping {
    MappingBuilder::new()
        .table(
            TableDef::new("heroes")
                .column(Column::new("id").auto_assign())
                .column(Column::new("kind"))
                .column(Column::new("name"))
                .column(Column::new("portrait"))
                .column(Column::new("power"))
                .primary_key(&["id"]),
        )
        .table(
            TableDef::new("flyers")
                .column(Column::new("id"))
                .column(Column::new("altitude"))
                .primary_key(&["id"])
                .foreign_key(ForeignKeyDef::new("fk_flyer_hero", &["id"], "heroes")),
        )
        .table(
            TableDef::new("hero_notes")
                .column(Column::new("id"))
                .column(Column::new("note"))
                .primary_key(&["id"])
                .foreign_key(ForeignKeyDef::new("fk_note_hero", &["id"], "heroes")),
        )
        .table(
            TableDef::new("villains")
                .column(Column::new("id"))
                .column(Column::new("name"))
                .primary_key(&["id"]),
        )
        .table(
            TableDef::new("audit")
                .column(Column::new("id").auto_assign())
                .column(Column::new("entry"))
                .primary_key(&["id"]),
        )
        .class(
            ClassDef::new("Hero", "heroes")
                .discriminator("kind")
                .discriminator_value("hero")
                .field(FieldDef::scalar("name", "name"))
                .field(FieldDef::lob("portrait", "portrait", 4))
                .field(FieldDef::scalar("note", "note").in_table("hero_notes")),
        )
        .class(
            ClassDef::joined("Flyer", "flyers", "Hero", "fk_flyer_hero")
                .discriminator_value("flyer")
                .field(FieldDef::scalar("altitude", "altitude")),
        )
        .class(
            ClassDef::single_table("Sidekick", "Hero")
                .discriminator_value("sidekick")
                .field(FieldDef::scalar("power", "power")),
        )
        .class(
            ClassDef::new("Villain", "villains")
                .field(FieldDef::scalar("name", "name"))
                .field(FieldDef::custom("audit", Arc::new(AuditTrail))),
        )
        .build()
        .expect("valid mapping")
}

fn setup() -> (Flusher, MemoryConnection) {
    let mapping = mapping();
    let conn = MemoryDatabase::new(&mapping).connect();
    (Flusher::new(Arc::new(mapping), StandardDialect::postgres()), conn)
}

fn run_flush(flusher: &Flusher, conn: &MemoryConnection, uow: &mut UnitOfWork) -> FlushReport {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async { unwrap_outcome(flusher.flush(&cx, conn, uow).await) })
}

fn prefixes(sql: &[String]) -> Vec<&str> {
    sql.iter()
        .map(|s| {
            let end = s.find(" (").or_else(|| s.find(" SET")).or_else(|| s.find(" WHERE"));
            end.map_or(s.as_str(), |i| &s[..i])
        })
        .collect()
}

#[test]
fn joined_insert_writes_root_then_subclass_then_secondary() {
    let (flusher, conn) = setup();
    let mut uow = UnitOfWork::new();
    let sam = uow.track_new(
        FLYER,
        vec![Value::Null],
        vec![
            Value::from("Sam").into(),
            Value::Bytes(vec![1, 2]).into(),
            Value::from("wings").into(),
            Value::BigInt(300).into(),
        ],
    );

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.stats.inserted, 3);
    assert_eq!(
        prefixes(&conn.executed_sql()),
        vec![
            "INSERT INTO \"heroes\"",
            "INSERT INTO \"flyers\"",
            "INSERT INTO \"hero_notes\""
        ]
    );
    let key = uow.get(sam).unwrap().key().to_vec();
    assert_eq!(key, vec![Value::BigInt(1)]);
    assert_eq!(conn.value("heroes", &key, "kind"), Some(Value::from("flyer")));
    assert_eq!(conn.value("heroes", &key, "portrait"), Some(Value::Bytes(vec![1, 2])));
    assert_eq!(conn.value("flyers", &key, "altitude"), Some(Value::BigInt(300)));
    assert_eq!(conn.value("hero_notes", &key, "note"), Some(Value::from("wings")));
}

#[test]
fn single_table_subclass_shares_the_root_row() {
    let (flusher, conn) = setup();
    let mut uow = UnitOfWork::new();
    let bucky = uow.track_new(
        SIDEKICK,
        vec![Value::Null],
        vec![
            Value::from("Bucky").into(),
            Value::Null.into(),
            Value::Null.into(),
            Value::from("arm").into(),
        ],
    );

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    let key = uow.get(bucky).unwrap().key().to_vec();
    assert_eq!(conn.row_count("heroes"), 1);
    assert_eq!(conn.row_count("flyers"), 0);
    assert_eq!(conn.value("heroes", &key, "kind"), Some(Value::from("sidekick")));
    assert_eq!(conn.value("heroes", &key, "power"), Some(Value::from("arm")));
    assert_eq!(conn.value("hero_notes", &key, "note"), Some(Value::Null));
}

#[test]
fn joined_delete_removes_secondary_and_leaf_first() {
    let (flusher, conn) = setup();
    let key = [Value::BigInt(1)];
    conn.seed(
        "heroes",
        &[
            ("id", Value::BigInt(1)),
            ("kind", Value::from("flyer")),
            ("name", Value::from("Sam")),
        ],
    )
    .unwrap();
    conn.seed("flyers", &[("id", Value::BigInt(1)), ("altitude", Value::BigInt(300))])
        .unwrap();
    conn.seed("hero_notes", &[("id", Value::BigInt(1)), ("note", Value::from("wings"))])
        .unwrap();

    let mut uow = UnitOfWork::new();
    let sam = uow.track_persistent(
        FLYER,
        key.to_vec(),
        vec![
            Value::from("Sam").into(),
            Value::Null.into(),
            Value::from("wings").into(),
            Value::BigInt(300).into(),
        ],
        None,
    );
    uow.mark_deleted(sam).unwrap();

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.stats.deleted, 3);
    assert_eq!(
        conn.executed_sql(),
        vec![
            "DELETE FROM \"hero_notes\" WHERE \"id\" = $1".to_string(),
            "DELETE FROM \"flyers\" WHERE \"id\" = $1".to_string(),
            "DELETE FROM \"heroes\" WHERE \"id\" = $1".to_string(),
        ]
    );
    for table in ["heroes", "flyers", "hero_notes"] {
        assert!(!conn.contains(table, &key), "{table} still holds the row");
    }
    assert_eq!(uow.get(sam).unwrap().state(), ObjectState::Removed);
}

#[test]
fn secondary_field_update_touches_only_its_table() {
    let (flusher, conn) = setup();
    conn.seed("heroes", &[("id", Value::BigInt(4)), ("name", Value::from("Sam"))])
        .unwrap();
    conn.seed("hero_notes", &[("id", Value::BigInt(4)), ("note", Value::from("old"))])
        .unwrap();
    let mut uow = UnitOfWork::new();
    let sam = uow.track_persistent(
        HERO,
        vec![Value::BigInt(4)],
        vec![Value::from("Sam").into(), Value::Null.into(), Value::from("old").into()],
        None,
    );
    uow.mark_dirty(sam, 2, Value::from("new")).unwrap();

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(
        conn.executed_sql(),
        vec!["UPDATE \"hero_notes\" SET \"note\" = $1 WHERE \"id\" = $2".to_string()]
    );
    assert_eq!(
        conn.value("hero_notes", &[Value::BigInt(4)], "note"),
        Some(Value::from("new"))
    );
}

#[test]
fn large_object_is_written_after_its_row() {
    let (flusher, conn) = setup();
    let portrait = vec![7_u8; 16];
    let mut uow = UnitOfWork::new();
    let thor = uow.track_new(
        HERO,
        vec![Value::Null],
        vec![
            Value::from("Thor").into(),
            Value::Bytes(portrait.clone()).into(),
            Value::Null.into(),
        ],
    );

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    let sql = conn.executed_sql();
    assert_eq!(
        sql.last().map(String::as_str),
        Some("UPDATE \"heroes\" SET \"portrait\" = $1 WHERE \"id\" = $2")
    );
    let insert = conn
        .executed()
        .into_iter()
        .find(|s| s.sql.starts_with("INSERT INTO \"heroes\""))
        .expect("heroes insert");
    assert!(!insert.params.contains(&Value::Bytes(portrait.clone())));

    let key = uow.get(thor).unwrap().key().to_vec();
    assert_eq!(conn.value("heroes", &key, "portrait"), Some(Value::Bytes(portrait.clone())));

    // Replacing it later needs only the large-object write.
    conn.clear_log();
    uow.mark_dirty(thor, 1, Value::Bytes(vec![9_u8; 32])).unwrap();
    let report = run_flush(&flusher, &conn, &mut uow);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(conn.executed_sql().len(), 1);
    assert_eq!(conn.value("heroes", &key, "portrait"), Some(Value::Bytes(vec![9_u8; 32])));
}

#[test]
fn discriminator_rewrite_without_field_changes() {
    let (flusher, conn) = setup();
    conn.seed("heroes", &[("id", Value::BigInt(2)), ("kind", Value::from("hero"))])
        .unwrap();
    let mut uow = UnitOfWork::new();
    let bucky = uow.track_persistent(
        SIDEKICK,
        vec![Value::BigInt(2)],
        vec![
            Value::Null.into(),
            Value::Null.into(),
            Value::Null.into(),
            Value::Null.into(),
        ],
        None,
    );
    uow.get_mut(bucky).unwrap().mark_indicators_dirty();

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(
        conn.executed_sql(),
        vec!["UPDATE \"heroes\" SET \"kind\" = $1 WHERE \"id\" = $2".to_string()]
    );
    assert_eq!(
        conn.value("heroes", &[Value::BigInt(2)], "kind"),
        Some(Value::from("sidekick"))
    );
    assert!(!uow.get(bucky).unwrap().indicators_dirty());
}

#[test]
fn custom_strategy_runs_statements_and_bulk_deletes() {
    let (flusher, conn) = setup();
    let mut uow = UnitOfWork::new();
    let loki = uow.track_new(
        VILLAIN,
        vec![Value::BigInt(1)],
        vec![Value::from("Loki").into(), Value::from("Loki").into()],
    );

    let report = run_flush(&flusher, &conn, &mut uow);
    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(
        prefixes(&conn.executed_sql()),
        vec!["INSERT INTO \"villains\"", "INSERT INTO \"audit\""]
    );
    assert_eq!(conn.row_count("audit"), 1);

    conn.seed("audit", &[("entry", Value::from("Loki"))]).unwrap();
    conn.seed("audit", &[("entry", Value::from("Hela"))]).unwrap();
    conn.clear_log();
    uow.mark_deleted(loki).unwrap();

    let report = run_flush(&flusher, &conn, &mut uow);

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(
        conn.executed_sql(),
        vec![
            "DELETE FROM \"audit\" WHERE \"entry\" = $1".to_string(),
            "DELETE FROM \"villains\" WHERE \"id\" = $1".to_string(),
        ]
    );
    assert_eq!(conn.row_count("audit"), 1);
    assert_eq!(conn.row_count("villains"), 0);
}
