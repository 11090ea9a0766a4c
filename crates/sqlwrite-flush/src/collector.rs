//! Operation collector: turns managed objects into rows.
//!
//! Inserts walk the hierarchy root to leaf, deletes leaf to root. Each field
//! contributes through its [`FieldStrategy`]; failures are recorded per object
//! and that object's rows are invalidated while the rest of the batch goes on.

use crate::row::{Row, VersionCheck};
use crate::row_manager::RowManager;
use sqlwrite_core::{
    Action, ClassId, ClassMapping, CustomMode, Error, FieldContext, FieldMapping, FieldStrategy,
    ForeignKeyId, LockIntent, ManagedObject, Mapping, ObjectId, ObjectState, Result, RowSink,
    TableId, Value,
};
use std::collections::{HashMap, HashSet};

/// Output of a collection pass.
#[derive(Debug, Default)]
pub struct Collection {
    pub rows: RowManager,
    pub errors: Vec<Error>,
    /// Objects that failed during collection
    pub failed: HashSet<ObjectId>,
    /// Version each owner stores once its rows succeed
    pub versions: HashMap<ObjectId, i64>,
}

/// Routes strategy contributions to the row for `(table, action, owner)`.
struct ObjectSink<'r> {
    mapping: &'r Mapping,
    rows: &'r mut RowManager,
    owner: ObjectId,
    class: ClassId,
    action: Action,
}

impl ObjectSink<'_> {
    fn row(&mut self, table: TableId) -> &mut Row {
        let secondary = self.mapping.is_secondary(self.class, table);
        let row = if secondary {
            self.rows
                .get_or_create_secondary_row(table, self.action, self.owner)
        } else {
            self.rows.get_or_create_row(table, self.action, self.owner)
        };
        if self.action != Action::Insert {
            row.set_key_where(true);
            if !secondary {
                row.set_failed_object(Some(self.owner));
            }
        }
        row
    }
}

impl RowSink for ObjectSink<'_> {
    fn set(&mut self, table: TableId, column: &str, value: Value) {
        self.row(table).set_column(column, value);
    }

    fn set_foreign_key(&mut self, fk: ForeignKeyId, target: Option<ObjectId>) {
        let mapping = self.mapping;
        self.row(fk.table())
            .set_foreign_key(fk, mapping.foreign_key(fk), target);
    }

    fn where_foreign_key(&mut self, fk: ForeignKeyId, target: ObjectId) {
        self.row(fk.table()).where_foreign_key(fk, target);
    }

    fn all_rows(
        &mut self,
        table: TableId,
        action: Action,
        set: Vec<(String, Value)>,
        matches: Vec<(String, Value)>,
    ) {
        let row = self.rows.create_all_rows_row(table, action);
        for (column, value) in set {
            row.set_column(&column, value);
        }
        for (column, value) in matches {
            row.where_column(&column, value);
        }
    }
}

/// Value written to the discriminator column: the nearest one declared on
/// the class or its ancestors.
fn discriminator_value(mapping: &Mapping, class: ClassId) -> Option<&Value> {
    mapping
        .hierarchy(class)
        .into_iter()
        .rev()
        .find_map(|cid| mapping.class(cid).discriminator_value.as_ref())
}

pub struct Collector<'a> {
    mapping: &'a Mapping,
    out: Collection,
}

impl<'a> Collector<'a> {
    pub fn new(mapping: &'a Mapping) -> Self {
        Self {
            mapping,
            out: Collection::default(),
        }
    }

    /// Collect rows for every object, in input order.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn collect<'o>(mut self, objects: impl IntoIterator<Item = &'o ManagedObject>) -> Collection {
        for obj in objects {
            if let Err(err) = self.collect_object(obj) {
                tracing::debug!(object = %obj.id(), error = %err, "Collection failed for object");
                self.out.rows.invalidate_owner(obj.id());
                self.out.versions.remove(&obj.id());
                self.out.failed.insert(obj.id());
                self.out.errors.push(err);
            }
        }
        tracing::debug!(
            rows = self.out.rows.len(),
            inserts = self.out.rows.inserts().len(),
            updates = self.out.rows.updates().len(),
            deletes = self.out.rows.deletes().len(),
            errors = self.out.errors.len(),
            "Collected rows"
        );
        self.out
    }

    fn collect_object(&mut self, obj: &ManagedObject) -> Result<()> {
        match obj.state() {
            ObjectState::New => self.insert(obj),
            ObjectState::Deleted => self.delete(obj),
            ObjectState::Removed => Ok(()),
            ObjectState::Persistent | ObjectState::Dirty => {
                let fields = obj.unflushed_dirty_fields();
                if !fields.is_empty() {
                    self.update(obj, &fields)
                } else if obj.indicators_dirty() || obj.lock() == LockIntent::Increment {
                    self.write_indicators(obj, obj.indicators_dirty());
                    Ok(())
                } else {
                    if obj.lock() == LockIntent::Check {
                        self.version_check(obj);
                    }
                    Ok(())
                }
            }
        }
    }

    fn sink(&mut self, obj: &ManagedObject, action: Action) -> ObjectSink<'_> {
        ObjectSink {
            mapping: self.mapping,
            rows: &mut self.out.rows,
            owner: obj.id(),
            class: obj.class(),
            action,
        }
    }

    fn apply_field(
        &mut self,
        obj: &ManagedObject,
        index: usize,
        field: &FieldMapping,
        action: Action,
    ) -> Result<()> {
        let value = obj.value(index).ok_or_else(|| {
            Error::user(obj.id(), Some(&field.name), "object carries no value for field")
        })?;
        let ctx = FieldContext {
            mapping: self.mapping,
            field,
            object: obj,
            value,
        };
        let mode = match action {
            Action::Insert => field.kind.custom_insert(&ctx),
            Action::Update => field.kind.custom_update(&ctx),
            Action::Delete => field.kind.custom_delete(&ctx),
        };
        if mode != CustomMode::Standard {
            if let Some(op) = field.kind.custom_operation(action, &ctx)? {
                self.out.rows.add_custom_operation(obj.id(), op);
            }
        }
        if mode != CustomMode::Custom {
            let mut sink = self.sink(obj, action);
            match action {
                Action::Insert => field.kind.contribute_insert(&ctx, &mut sink)?,
                Action::Update => field.kind.contribute_update(&ctx, &mut sink)?,
                Action::Delete => field.kind.contribute_delete(&ctx, &mut sink)?,
            }
        }
        Ok(())
    }

    fn apply_fields(
        &mut self,
        obj: &ManagedObject,
        class: &ClassMapping,
        action: Action,
        only: Option<&[usize]>,
    ) -> Result<()> {
        for (local, field) in class.fields.iter().enumerate() {
            let index = class.field_offset + local;
            if only.is_none_or(|set| set.contains(&index)) {
                self.apply_field(obj, index, field, action)?;
            }
        }
        Ok(())
    }

    fn insert(&mut self, obj: &ManagedObject) -> Result<()> {
        let mapping = self.mapping;
        let chain = mapping.hierarchy(obj.class());
        for &cid in &chain {
            let class = mapping.class(cid);
            if class.has_own_table(mapping) {
                let row = self
                    .out
                    .rows
                    .get_or_create_row(class.table, Action::Insert, obj.id());
                if let Some(join) = class.join_foreign_key {
                    row.set_foreign_key(join, mapping.foreign_key(join), Some(obj.id()));
                }
                if class.superclass.is_none() {
                    if let Some(column) = &class.version_column {
                        let next = obj.next_version();
                        row.set_column(column, Value::BigInt(next));
                        self.out.versions.insert(obj.id(), next);
                    }
                    if let (Some(column), Some(value)) = (
                        &class.discriminator_column,
                        discriminator_value(mapping, obj.class()),
                    ) {
                        row.set_column(column, value.clone());
                    }
                }
            }
            self.apply_fields(obj, class, Action::Insert, None)?;
        }
        for &cid in &chain {
            for &table in &mapping.class(cid).secondary_tables {
                self.out
                    .rows
                    .get_or_create_secondary_row(table, Action::Insert, obj.id());
            }
        }
        Ok(())
    }

    fn update(&mut self, obj: &ManagedObject, fields: &[usize]) -> Result<()> {
        let mapping = self.mapping;
        for cid in mapping.hierarchy(obj.class()) {
            self.apply_fields(obj, mapping.class(cid), Action::Update, Some(fields))?;
        }
        self.write_indicators(obj, obj.indicators_dirty());
        Ok(())
    }

    /// Version bump on the root row, plus the discriminator when requested.
    fn write_indicators(&mut self, obj: &ManagedObject, discriminator: bool) {
        let mapping = self.mapping;
        let root = mapping.class(mapping.root(obj.class()));
        let discriminator = if discriminator {
            root.discriminator_column
                .as_ref()
                .zip(discriminator_value(mapping, obj.class()))
        } else {
            None
        };
        if root.version_column.is_none() && discriminator.is_none() {
            return;
        }

        let next = obj.next_version();
        let mut sink = self.sink(obj, Action::Update);
        let row = sink.row(root.table);
        if let Some(column) = &root.version_column {
            row.set_column(column, Value::BigInt(next));
            row.where_column(column, obj.version().map_or(Value::Null, Value::BigInt));
        }
        if let Some((column, value)) = discriminator {
            row.set_column(column, value.clone());
        }
        if root.version_column.is_some() {
            self.out.versions.insert(obj.id(), next);
        }
    }

    fn delete(&mut self, obj: &ManagedObject) -> Result<()> {
        let mapping = self.mapping;
        let chain = mapping.hierarchy(obj.class());
        for &cid in chain.iter().rev() {
            let class = mapping.class(cid);
            self.apply_fields(obj, class, Action::Delete, None)?;
            if class.has_own_table(mapping) {
                let mut sink = self.sink(obj, Action::Delete);
                let row = sink.row(class.table);
                if let Some(join) = class.join_foreign_key {
                    row.where_foreign_key(join, obj.id());
                }
                if class.superclass.is_none() {
                    if let Some(column) = &class.version_column {
                        row.where_column(column, obj.version().map_or(Value::Null, Value::BigInt));
                    }
                }
            }
        }
        for &cid in &chain {
            for &table in &mapping.class(cid).secondary_tables {
                self.out
                    .rows
                    .get_or_create_secondary_row(table, Action::Delete, obj.id())
                    .set_key_where(true);
            }
        }
        Ok(())
    }

    fn version_check(&mut self, obj: &ManagedObject) {
        let mapping = self.mapping;
        let root = mapping.class(mapping.root(obj.class()));
        if root.version_column.is_some() {
            self.out.rows.add_version_check(VersionCheck {
                owner: obj.id(),
                table: root.table,
                expected: obj.version(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowKind;
    use sqlwrite_core::{
        ClassDef, Column, CustomOperation, FieldDef, FieldValue, ForeignKeyDef, MappingBuilder,
        TableDef,
    };

    fn mapping() -> Mapping {
        MappingBuilder::new()
            .table(
                TableDef::new("teams")
                    .column(Column::new("id").auto_assign())
                    .column(Column::new("name"))
                    .primary_key(&["id"]),
            )
            .table(
                TableDef::new("heroes")
                    .column(Column::new("id").auto_assign())
                    .column(Column::new("name"))
                    .column(Column::new("kind"))
                    .column(Column::new("version"))
                    .column(Column::new("portrait"))
                    .column(Column::new("team_id").not_null())
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_hero_team", &["team_id"], "teams")),
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
                    .primary_key(&["id"]),
            )
            .class(ClassDef::new("Team", "teams").field(FieldDef::scalar("name", "name")))
            .class(
                ClassDef::new("Hero", "heroes")
                    .version("version")
                    .discriminator("kind")
                    .discriminator_value("hero")
                    .field(FieldDef::scalar("name", "name"))
                    .field(FieldDef::relation("team", "fk_hero_team", "Team"))
                    .field(FieldDef::lob("portrait", "portrait", 4))
                    .field(FieldDef::scalar("note", "note").in_table("hero_notes")),
            )
            .class(
                ClassDef::joined("Flyer", "flyers", "Hero", "fk_flyer_hero")
                    .discriminator_value("flyer")
                    .field(FieldDef::scalar("altitude", "altitude")),
            )
            .build()
            .unwrap()
    }

    fn team(id: u64) -> ManagedObject {
        ManagedObject::new(
            ObjectId::new(id),
            ClassId::new(0),
            ObjectState::New,
            vec![Value::Null],
            vec![FieldValue::Value(Value::from("Avengers"))],
        )
    }

    fn flyer(id: u64, state: ObjectState, team: Option<u64>, portrait: &[u8]) -> ManagedObject {
        ManagedObject::new(
            ObjectId::new(id),
            ClassId::new(2),
            state,
            vec![if state == ObjectState::New {
                Value::Null
            } else {
                Value::BigInt(id as i64)
            }],
            vec![
                FieldValue::Value(Value::from("Falcon")),
                FieldValue::Ref(team.map(ObjectId::new)),
                FieldValue::Value(Value::Bytes(portrait.to_vec())),
                FieldValue::Value(Value::from("wings")),
                FieldValue::Value(Value::Int(300)),
            ],
        )
    }

    #[test]
    fn test_insert_walks_root_to_leaf() {
        let m = mapping();
        let objects = [team(1), flyer(2, ObjectState::New, Some(1), b"ab")];
        let out = Collector::new(&m).collect(objects.iter());
        assert!(out.errors.is_empty());

        let heroes = m.table_by_name("heroes").unwrap();
        let flyers = m.table_by_name("flyers").unwrap();
        let notes = m.table_by_name("hero_notes").unwrap();
        let owner = ObjectId::new(2);

        let hero_row = out.rows.row(out.rows.lookup(heroes, Action::Insert, owner).unwrap());
        let flyer_row = out.rows.row(out.rows.lookup(flyers, Action::Insert, owner).unwrap());
        assert!(hero_row.index() < flyer_row.index());
        assert!(hero_row
            .set_values()
            .contains(&("kind".to_string(), Value::from("flyer"))));
        assert!(hero_row
            .set_values()
            .contains(&("version".to_string(), Value::BigInt(1))));
        let fk_team = m.foreign_key_by_name("fk_hero_team").unwrap();
        assert_eq!(hero_row.foreign_key_target(fk_team), Some(ObjectId::new(1)));

        let note_row = out.rows.row(out.rows.lookup(notes, Action::Insert, owner).unwrap());
        assert_eq!(note_row.kind(), RowKind::Secondary);
        assert_eq!(out.rows.secondary_updates().len(), 1);
        assert_eq!(out.versions.get(&owner), Some(&1));
    }

    #[test]
    fn test_dirty_update_touches_only_unflushed_fields() {
        let m = mapping();
        let mut hero = flyer(5, ObjectState::Persistent, Some(1), b"ab").with_version(3);
        hero.set_value(4, FieldValue::Value(Value::Int(900)));
        let out = Collector::new(&m).collect([&hero]);

        let heroes = m.table_by_name("heroes").unwrap();
        let flyers = m.table_by_name("flyers").unwrap();
        let flyer_row = out.rows.row(out.rows.lookup(flyers, Action::Update, hero.id()).unwrap());
        assert_eq!(
            flyer_row.set_values(),
            &[("altitude".to_string(), Value::Int(900))]
        );
        assert!(flyer_row.uses_key_where());
        assert_eq!(flyer_row.failed_object(), Some(hero.id()));

        let root = out.rows.row(out.rows.lookup(heroes, Action::Update, hero.id()).unwrap());
        assert_eq!(root.set_values(), &[("version".to_string(), Value::BigInt(4))]);
        assert_eq!(root.where_values(), &[("version".to_string(), Value::BigInt(3))]);
    }

    #[test]
    fn test_clean_object_is_skipped() {
        let m = mapping();
        let hero = flyer(5, ObjectState::Persistent, Some(1), b"ab");
        let out = Collector::new(&m).collect([&hero]);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_delete_walks_leaf_to_root() {
        let m = mapping();
        let mut hero = flyer(6, ObjectState::Persistent, Some(1), b"ab").with_version(2);
        hero.mark_deleted();
        let out = Collector::new(&m).collect([&hero]);

        let heroes = m.table_by_name("heroes").unwrap();
        let flyers = m.table_by_name("flyers").unwrap();
        let sub = out.rows.row(out.rows.lookup(flyers, Action::Delete, hero.id()).unwrap());
        let root = out.rows.row(out.rows.lookup(heroes, Action::Delete, hero.id()).unwrap());
        assert!(sub.index() < root.index());
        let join = m.foreign_key_by_name("fk_flyer_hero").unwrap();
        assert_eq!(sub.foreign_keys_where(), &[(join, hero.id())]);
        let fk_team = m.foreign_key_by_name("fk_hero_team").unwrap();
        assert_eq!(root.foreign_keys_where(), &[(fk_team, ObjectId::new(1))]);
        assert_eq!(root.where_values(), &[("version".to_string(), Value::BigInt(2))]);
        assert_eq!(out.rows.secondary_deletes().len(), 1);
    }

    #[test]
    fn test_null_required_relation_is_collected_as_error() {
        let m = mapping();
        let objects = [flyer(2, ObjectState::New, None, b""), team(1)];
        let out = Collector::new(&m).collect(objects.iter());

        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], Error::User(_)));
        assert!(out.failed.contains(&ObjectId::new(2)));
        let heroes = m.table_by_name("heroes").unwrap();
        let bad = out.rows.lookup(heroes, Action::Insert, ObjectId::new(2)).unwrap();
        assert!(!out.rows.row(bad).is_valid());
        let teams = m.table_by_name("teams").unwrap();
        let good = out.rows.lookup(teams, Action::Insert, ObjectId::new(1)).unwrap();
        assert!(out.rows.row(good).is_valid());
    }

    #[test]
    fn test_large_lob_is_written_after_the_row() {
        let m = mapping();
        let hero = flyer(2, ObjectState::New, Some(1), b"0123456789");
        let out = Collector::new(&m).collect([&hero]);

        let heroes = m.table_by_name("heroes").unwrap();
        let row = out.rows.row(out.rows.lookup(heroes, Action::Insert, hero.id()).unwrap());
        assert!(row
            .set_values()
            .contains(&("portrait".to_string(), Value::Null)));
        assert_eq!(out.rows.custom_operations().len(), 1);
        assert_eq!(
            out.rows.custom_operations()[0].operation,
            CustomOperation::UpdateColumns {
                table: heroes,
                values: vec![(
                    "portrait".to_string(),
                    Value::Bytes(b"0123456789".to_vec())
                )],
            }
        );
    }

    #[test]
    fn test_indicator_and_check_intents() {
        let m = mapping();
        let bump = flyer(7, ObjectState::Persistent, Some(1), b"")
            .with_version(1)
            .with_lock(LockIntent::Increment);
        let check = flyer(8, ObjectState::Persistent, Some(1), b"")
            .with_version(9)
            .with_lock(LockIntent::Check);
        let out = Collector::new(&m).collect([&bump, &check]);

        let heroes = m.table_by_name("heroes").unwrap();
        let row = out.rows.row(out.rows.lookup(heroes, Action::Update, bump.id()).unwrap());
        assert_eq!(row.set_values(), &[("version".to_string(), Value::BigInt(2))]);
        assert!(out.rows.lookup(heroes, Action::Update, check.id()).is_none());
        assert_eq!(
            out.rows.version_checks(),
            &[VersionCheck {
                owner: check.id(),
                table: heroes,
                expected: Some(9),
            }]
        );
    }
}
