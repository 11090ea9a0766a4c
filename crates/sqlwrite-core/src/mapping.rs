//! Class mapping tree and per-field write strategies.
//!
//! A [`Mapping`] is the resolved "table + column + foreign key" description
//! of every persistent class. It is built once with [`MappingBuilder`] and
//! shared (usually behind an `Arc`) by every flush.
//!
//! Field contribution is expressed through the [`FieldStrategy`] capability
//! interface. The built-in column mapping kinds are the variants of
//! [`FieldKind`]; user-defined persistence plugs in via [`FieldKind::Custom`].

use crate::error::{Error, MappingErrorKind, Result};
use crate::object::{FieldValue, ManagedObject, ObjectId};
use crate::schema::{Column, ForeignKey, ForeignKeyId, Table, TableId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Index of a class inside a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) usize);

impl ClassId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// The SQL action a row performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state answer of the custom-operation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CustomMode {
    /// Standard row contribution only.
    #[default]
    Standard,
    /// Buffer a custom operation and still contribute to the row.
    Both,
    /// Buffer a custom operation; no row is created for this fragment.
    Custom,
}

/// Work a strategy asks to run after the standard rows were flushed.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomOperation {
    /// Set columns on the owner's row in `table`, matched by identity key.
    UpdateColumns {
        table: TableId,
        values: Vec<(String, Value)>,
    },
    /// Run an arbitrary statement.
    Statement { sql: String, params: Vec<Value> },
}

/// Destination for column contributions.
///
/// The collector implements this by routing each call to the row for
/// `(table, action, owner)`.
pub trait RowSink {
    /// Assign (INSERT/UPDATE) a column value.
    fn set(&mut self, table: TableId, column: &str, value: Value);

    /// Assign a foreign key. `None` nulls its columns.
    fn set_foreign_key(&mut self, fk: ForeignKeyId, target: Option<ObjectId>);

    /// Record that the row being located references `target` through `fk`.
    fn where_foreign_key(&mut self, fk: ForeignKeyId, target: ObjectId);

    /// Queue a bulk statement over every row of `table` matching `matches`.
    /// The affected row count is not checked.
    fn all_rows(
        &mut self,
        table: TableId,
        action: Action,
        set: Vec<(String, Value)>,
        matches: Vec<(String, Value)>,
    );
}

/// Everything a strategy may look at while contributing one field.
#[derive(Debug, Clone, Copy)]
pub struct FieldContext<'a> {
    pub mapping: &'a Mapping,
    pub field: &'a FieldMapping,
    pub object: &'a ManagedObject,
    pub value: &'a FieldValue,
}

/// Capability interface for per-field SQL contribution.
pub trait FieldStrategy: Send + Sync + fmt::Debug {
    fn custom_insert(&self, _ctx: &FieldContext<'_>) -> CustomMode {
        CustomMode::Standard
    }

    fn custom_update(&self, _ctx: &FieldContext<'_>) -> CustomMode {
        CustomMode::Standard
    }

    fn custom_delete(&self, _ctx: &FieldContext<'_>) -> CustomMode {
        CustomMode::Standard
    }

    /// Operation to buffer when the matching `custom_*` hook did not answer `Standard`.
    fn custom_operation(
        &self,
        _action: Action,
        _ctx: &FieldContext<'_>,
    ) -> Result<Option<CustomOperation>> {
        Ok(None)
    }

    fn contribute_insert(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()>;

    fn contribute_update(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()>;

    fn contribute_delete(&self, _ctx: &FieldContext<'_>, _sink: &mut dyn RowSink) -> Result<()> {
        Ok(())
    }
}

/// Column mapping kinds.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// One column holding the field value.
    Scalar { column: String },
    /// A reference to another object through a foreign key on the field's table.
    Relation { foreign_key: ForeignKeyId, target: ClassId },
    /// Large object; values above `inline_limit` bytes are written after the row.
    Lob { column: String, inline_limit: usize },
    /// User-defined strategy.
    Custom(Arc<dyn FieldStrategy>),
}

fn expect_value<'a>(ctx: &FieldContext<'a>) -> Result<&'a Value> {
    ctx.value.as_value().ok_or_else(|| {
        Error::user(
            ctx.object.id(),
            Some(&ctx.field.name),
            "expected a column value, found an object reference",
        )
    })
}

fn expect_ref(ctx: &FieldContext<'_>) -> Result<Option<ObjectId>> {
    ctx.value.as_ref_target().ok_or_else(|| {
        Error::user(
            ctx.object.id(),
            Some(&ctx.field.name),
            "expected an object reference, found a column value",
        )
    })
}

impl FieldKind {
    fn lob_is_large(ctx: &FieldContext<'_>, inline_limit: usize) -> bool {
        ctx.value
            .as_value()
            .is_some_and(|v| v.byte_len() > inline_limit)
    }

    fn contribute_relation(
        ctx: &FieldContext<'_>,
        foreign_key: ForeignKeyId,
        sink: &mut dyn RowSink,
    ) -> Result<()> {
        let target = expect_ref(ctx)?;
        if target.is_none() && !ctx.mapping.foreign_key(foreign_key).nullable {
            return Err(Error::user(
                ctx.object.id(),
                Some(&ctx.field.name),
                format!(
                    "relation is required by NOT NULL foreign key '{}'",
                    ctx.mapping.foreign_key(foreign_key).name
                ),
            ));
        }
        sink.set_foreign_key(foreign_key, target);
        Ok(())
    }

    fn lob_placeholder(ctx: &FieldContext<'_>, column: &str) -> Value {
        let nullable = ctx
            .mapping
            .table(ctx.field.table)
            .column(column)
            .is_none_or(|c| c.nullable);
        if nullable {
            Value::Null
        } else {
            Value::Bytes(Vec::new())
        }
    }
}

impl FieldStrategy for FieldKind {
    fn custom_insert(&self, ctx: &FieldContext<'_>) -> CustomMode {
        match self {
            FieldKind::Lob { inline_limit, .. } if Self::lob_is_large(ctx, *inline_limit) => {
                CustomMode::Both
            }
            FieldKind::Custom(strategy) => strategy.custom_insert(ctx),
            _ => CustomMode::Standard,
        }
    }

    fn custom_update(&self, ctx: &FieldContext<'_>) -> CustomMode {
        match self {
            FieldKind::Lob { inline_limit, .. } if Self::lob_is_large(ctx, *inline_limit) => {
                CustomMode::Both
            }
            FieldKind::Custom(strategy) => strategy.custom_update(ctx),
            _ => CustomMode::Standard,
        }
    }

    fn custom_delete(&self, ctx: &FieldContext<'_>) -> CustomMode {
        match self {
            FieldKind::Custom(strategy) => strategy.custom_delete(ctx),
            _ => CustomMode::Standard,
        }
    }

    fn custom_operation(
        &self,
        action: Action,
        ctx: &FieldContext<'_>,
    ) -> Result<Option<CustomOperation>> {
        match self {
            FieldKind::Lob { column, .. } if action != Action::Delete => {
                let value = expect_value(ctx)?.clone();
                Ok(Some(CustomOperation::UpdateColumns {
                    table: ctx.field.table,
                    values: vec![(column.clone(), value)],
                }))
            }
            FieldKind::Custom(strategy) => strategy.custom_operation(action, ctx),
            _ => Ok(None),
        }
    }

    fn contribute_insert(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()> {
        match self {
            FieldKind::Scalar { column } => {
                sink.set(ctx.field.table, column, expect_value(ctx)?.clone());
                Ok(())
            }
            FieldKind::Relation { foreign_key, .. } => {
                Self::contribute_relation(ctx, *foreign_key, sink)
            }
            FieldKind::Lob {
                column,
                inline_limit,
            } => {
                let value = if Self::lob_is_large(ctx, *inline_limit) {
                    Self::lob_placeholder(ctx, column)
                } else {
                    expect_value(ctx)?.clone()
                };
                sink.set(ctx.field.table, column, value);
                Ok(())
            }
            FieldKind::Custom(strategy) => strategy.contribute_insert(ctx, sink),
        }
    }

    fn contribute_update(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()> {
        match self {
            FieldKind::Scalar { column } => {
                sink.set(ctx.field.table, column, expect_value(ctx)?.clone());
                Ok(())
            }
            FieldKind::Relation { foreign_key, .. } => {
                Self::contribute_relation(ctx, *foreign_key, sink)
            }
            FieldKind::Lob {
                column,
                inline_limit,
            } => {
                // Large values are written by the buffered custom operation.
                if !Self::lob_is_large(ctx, *inline_limit) {
                    sink.set(ctx.field.table, column, expect_value(ctx)?.clone());
                }
                Ok(())
            }
            FieldKind::Custom(strategy) => strategy.contribute_update(ctx, sink),
        }
    }

    fn contribute_delete(&self, ctx: &FieldContext<'_>, sink: &mut dyn RowSink) -> Result<()> {
        match self {
            FieldKind::Relation { foreign_key, .. } => {
                if let Some(target) = expect_ref(ctx)? {
                    sink.where_foreign_key(*foreign_key, target);
                }
                Ok(())
            }
            FieldKind::Custom(strategy) => strategy.contribute_delete(ctx, sink),
            _ => Ok(()),
        }
    }
}

/// A resolved field.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    /// Field name, unique within its hierarchy
    pub name: String,
    /// Table that stores the field
    pub table: TableId,
    /// How the field is written
    pub kind: FieldKind,
}

/// A resolved class in the mapping tree.
#[derive(Debug, Clone)]
pub struct ClassMapping {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    /// Own table for joined subclasses and roots; inherited for single-table subclasses
    pub table: TableId,
    /// Foreign key from a joined subclass table to its superclass table
    pub join_foreign_key: Option<ForeignKeyId>,
    /// Fields declared by this class
    pub fields: Vec<FieldMapping>,
    /// Flattened index of the first declared field
    pub field_offset: usize,
    /// Version column on the root table (roots only)
    pub version_column: Option<String>,
    /// Discriminator column on the root table (roots only)
    pub discriminator_column: Option<String>,
    /// This class's discriminator value
    pub discriminator_value: Option<Value>,
    /// Secondary tables joined to this class's table
    pub secondary_tables: Vec<TableId>,
}

impl ClassMapping {
    /// Whether this class writes rows to a table of its own.
    pub fn has_own_table(&self, mapping: &Mapping) -> bool {
        match self.superclass {
            Some(parent) => mapping.class(parent).table != self.table,
            None => true,
        }
    }
}

/// The resolved mapping of every class and table.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    tables: Vec<Table>,
    classes: Vec<ClassMapping>,
    table_index: HashMap<String, TableId>,
    class_index: HashMap<String, ClassId>,
}

impl Mapping {
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn classes(&self) -> &[ClassMapping] {
        &self.classes
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableId> {
        self.table_index.get(name).copied()
    }

    pub fn class(&self, id: ClassId) -> &ClassMapping {
        &self.classes[id.0]
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.class_index.get(name).copied()
    }

    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.tables[id.table.0].foreign_keys[id.index]
    }

    pub fn foreign_key_by_name(&self, name: &str) -> Option<ForeignKeyId> {
        self.tables.iter().find_map(|t| {
            t.foreign_keys
                .iter()
                .position(|fk| fk.name == name)
                .map(|index| t.foreign_key_id(index))
        })
    }

    /// Root-to-leaf chain ending at `class`.
    pub fn hierarchy(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = vec![class];
        let mut current = self.class(class).superclass;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.class(parent).superclass;
        }
        chain.reverse();
        chain
    }

    pub fn root(&self, class: ClassId) -> ClassId {
        let mut current = class;
        while let Some(parent) = self.class(current).superclass {
            current = parent;
        }
        current
    }

    /// Number of flattened fields of `class` including inherited ones.
    pub fn field_count(&self, class: ClassId) -> usize {
        let c = self.class(class);
        c.field_offset + c.fields.len()
    }

    /// Field at a flattened index.
    pub fn field(&self, class: ClassId, index: usize) -> Option<&FieldMapping> {
        self.hierarchy(class).into_iter().find_map(|cid| {
            let c = self.class(cid);
            index
                .checked_sub(c.field_offset)
                .and_then(|local| c.fields.get(local))
        })
    }

    /// Flattened index of a field by name.
    pub fn field_index(&self, class: ClassId, name: &str) -> Option<usize> {
        self.hierarchy(class).into_iter().find_map(|cid| {
            let c = self.class(cid);
            c.fields
                .iter()
                .position(|f| f.name == name)
                .map(|local| c.field_offset + local)
        })
    }

    /// Whether `table` is a secondary table somewhere in `class`'s hierarchy.
    pub fn is_secondary(&self, class: ClassId, table: TableId) -> bool {
        self.hierarchy(class)
            .into_iter()
            .any(|cid| self.class(cid).secondary_tables.contains(&table))
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Unresolved foreign key definition.
#[derive(Debug, Clone)]
pub struct ForeignKeyDef {
    name: String,
    columns: Vec<String>,
    references: String,
    deferred: bool,
}

impl ForeignKeyDef {
    pub fn new(name: impl Into<String>, columns: &[&str], references: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            references: references.into(),
            deferred: false,
        }
    }

    /// Mark the constraint as logical or deferrable.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// Unresolved table definition.
#[derive(Debug, Clone)]
pub struct TableDef {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }
}

#[derive(Debug, Clone)]
enum FieldKindDef {
    Scalar(String),
    Relation { foreign_key: String, target: String },
    Lob { column: String, inline_limit: usize },
    Custom(Arc<dyn FieldStrategy>),
}

/// Unresolved field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    table: Option<String>,
    kind: FieldKindDef,
}

impl FieldDef {
    pub fn scalar(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            kind: FieldKindDef::Scalar(column.into()),
        }
    }

    pub fn relation(
        name: impl Into<String>,
        foreign_key: impl Into<String>,
        target_class: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: None,
            kind: FieldKindDef::Relation {
                foreign_key: foreign_key.into(),
                target: target_class.into(),
            },
        }
    }

    pub fn lob(name: impl Into<String>, column: impl Into<String>, inline_limit: usize) -> Self {
        Self {
            name: name.into(),
            table: None,
            kind: FieldKindDef::Lob {
                column: column.into(),
                inline_limit,
            },
        }
    }

    pub fn custom(name: impl Into<String>, strategy: Arc<dyn FieldStrategy>) -> Self {
        Self {
            name: name.into(),
            table: None,
            kind: FieldKindDef::Custom(strategy),
        }
    }

    /// Store the field in a table other than the class table.
    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Unresolved class definition.
#[derive(Debug, Clone)]
pub struct ClassDef {
    name: String,
    table: Option<String>,
    superclass: Option<String>,
    join_foreign_key: Option<String>,
    fields: Vec<FieldDef>,
    version_column: Option<String>,
    discriminator_column: Option<String>,
    discriminator_value: Option<Value>,
    secondary_tables: Vec<String>,
}

impl ClassDef {
    /// A root class stored in `table`.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Some(table.into()),
            superclass: None,
            join_foreign_key: None,
            fields: Vec::new(),
            version_column: None,
            discriminator_column: None,
            discriminator_value: None,
            secondary_tables: Vec::new(),
        }
    }

    /// A subclass sharing its superclass's table.
    pub fn single_table(name: impl Into<String>, superclass: impl Into<String>) -> Self {
        let mut def = Self::new(name, String::new());
        def.table = None;
        def.superclass = Some(superclass.into());
        def
    }

    /// A subclass with its own table joined to the superclass table.
    pub fn joined(
        name: impl Into<String>,
        table: impl Into<String>,
        superclass: impl Into<String>,
        join_foreign_key: impl Into<String>,
    ) -> Self {
        let mut def = Self::new(name, table);
        def.superclass = Some(superclass.into());
        def.join_foreign_key = Some(join_foreign_key.into());
        def
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn version(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    pub fn discriminator(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = Some(column.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn secondary_table(mut self, table: impl Into<String>) -> Self {
        self.secondary_tables.push(table.into());
        self
    }
}

/// Resolves table and class definitions into a [`Mapping`].
#[derive(Debug, Clone, Default)]
pub struct MappingBuilder {
    tables: Vec<TableDef>,
    classes: Vec<ClassDef>,
}

impl MappingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tables = self.tables.len(), classes = self.classes.len()))]
    pub fn build(self) -> Result<Mapping> {
        let mut mapping = Mapping::default();
        self.resolve_tables(&mut mapping)?;
        self.resolve_classes(&mut mapping)?;
        tracing::debug!("Mapping resolved");
        Ok(mapping)
    }

    fn resolve_tables(&self, mapping: &mut Mapping) -> Result<()> {
        for (i, def) in self.tables.iter().enumerate() {
            if mapping
                .table_index
                .insert(def.name.clone(), TableId(i))
                .is_some()
            {
                return Err(Error::mapping(
                    MappingErrorKind::Duplicate,
                    format!("table '{}' defined twice", def.name),
                ));
            }
        }

        let mut fk_names = HashSet::new();
        for (i, def) in self.tables.iter().enumerate() {
            let mut columns = def.columns.clone();
            for pk in &def.primary_key {
                let column = columns.iter_mut().find(|c| &c.name == pk).ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::UnknownColumn,
                        format!("primary key column '{}.{}' not defined", def.name, pk),
                    )
                })?;
                column.nullable = false;
            }
            mapping.tables.push(Table {
                id: TableId(i),
                name: def.name.clone(),
                columns,
                primary_key: def.primary_key.clone(),
                foreign_keys: Vec::new(),
            });
            for fk in &def.foreign_keys {
                if !fk_names.insert(fk.name.clone()) {
                    return Err(Error::mapping(
                        MappingErrorKind::Duplicate,
                        format!("foreign key '{}' defined twice", fk.name),
                    ));
                }
            }
        }

        for (i, def) in self.tables.iter().enumerate() {
            for fk in &def.foreign_keys {
                let referenced = mapping.table_by_name(&fk.references).ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::UnknownTable,
                        format!(
                            "foreign key '{}' references unknown table '{}'",
                            fk.name, fk.references
                        ),
                    )
                })?;
                let referenced_pk = mapping.tables[referenced.0].primary_key.len();
                if referenced_pk != fk.columns.len() || fk.columns.is_empty() {
                    return Err(Error::mapping(
                        MappingErrorKind::KeyArity,
                        format!(
                            "foreign key '{}' has {} columns but '{}' has a {}-column primary key",
                            fk.name,
                            fk.columns.len(),
                            fk.references,
                            referenced_pk
                        ),
                    ));
                }
                let table = &mapping.tables[i];
                let mut nullable = true;
                for col in &fk.columns {
                    let column = table.column(col).ok_or_else(|| {
                        Error::mapping(
                            MappingErrorKind::UnknownColumn,
                            format!("foreign key column '{}.{}' not defined", table.name, col),
                        )
                    })?;
                    nullable &= column.nullable;
                }
                mapping.tables[i].foreign_keys.push(ForeignKey {
                    name: fk.name.clone(),
                    columns: fk.columns.clone(),
                    referenced_table: referenced,
                    nullable,
                    deferred: fk.deferred,
                });
            }
        }
        Ok(())
    }

    fn lookup_table(mapping: &Mapping, name: &str) -> Result<TableId> {
        mapping.table_by_name(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownTable,
                format!("unknown table '{}'", name),
            )
        })
    }

    fn require_column(mapping: &Mapping, table: TableId, column: &str) -> Result<()> {
        if mapping.table(table).column(column).is_some() {
            Ok(())
        } else {
            Err(Error::mapping(
                MappingErrorKind::UnknownColumn,
                format!(
                    "column '{}.{}' not defined",
                    mapping.table(table).name,
                    column
                ),
            ))
        }
    }

    fn lookup_foreign_key(mapping: &Mapping, table: TableId, name: &str) -> Result<ForeignKeyId> {
        let t = mapping.table(table);
        t.foreign_keys
            .iter()
            .position(|fk| fk.name == name)
            .map(|index| t.foreign_key_id(index))
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownForeignKey,
                    format!("foreign key '{}' not declared on table '{}'", name, t.name),
                )
            })
    }

    /// Superclasses listed before subclasses, with cycle detection.
    fn class_order(&self) -> Result<Vec<usize>> {
        let by_name: HashMap<&str, usize> = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        if by_name.len() != self.classes.len() {
            return Err(Error::mapping(
                MappingErrorKind::Duplicate,
                "class defined twice",
            ));
        }

        let mut order = Vec::with_capacity(self.classes.len());
        let mut placed = vec![false; self.classes.len()];
        for start in 0..self.classes.len() {
            let mut chain = Vec::new();
            let mut current = Some(start);
            while let Some(i) = current {
                if placed[i] {
                    break;
                }
                if chain.contains(&i) {
                    return Err(Error::mapping(
                        MappingErrorKind::InheritanceCycle,
                        format!("class '{}' inherits from itself", self.classes[i].name),
                    ));
                }
                chain.push(i);
                current = match &self.classes[i].superclass {
                    Some(parent) => Some(*by_name.get(parent.as_str()).ok_or_else(|| {
                        Error::mapping(
                            MappingErrorKind::UnknownClass,
                            format!("unknown superclass '{}'", parent),
                        )
                    })?),
                    None => None,
                };
            }
            for i in chain.into_iter().rev() {
                placed[i] = true;
                order.push(i);
            }
        }
        Ok(order)
    }

    fn resolve_classes(&self, mapping: &mut Mapping) -> Result<()> {
        let order = self.class_order()?;
        // Ids follow definition order so callers can predict them.
        for (i, def) in self.classes.iter().enumerate() {
            mapping.class_index.insert(def.name.clone(), ClassId(i));
        }
        let mut resolved: Vec<Option<ClassMapping>> = vec![None; self.classes.len()];

        for i in order {
            let def = &self.classes[i];
            let superclass = def
                .superclass
                .as_ref()
                .and_then(|name| mapping.class_by_name(name));
            let parent = superclass.and_then(|p| resolved[p.0].as_ref());

            let table = match (&def.table, parent) {
                (Some(name), _) => Self::lookup_table(mapping, name)?,
                (None, Some(parent)) => parent.table,
                (None, None) => {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownTable,
                        format!("class '{}' has no table", def.name),
                    ));
                }
            };

            let root_table = parent.map_or(table, |p| {
                let mut root = p;
                while let Some(s) = root.superclass {
                    match resolved[s.0].as_ref() {
                        Some(c) => root = c,
                        None => break,
                    }
                }
                root.table
            });
            let key_arity = mapping.table(root_table).primary_key.len();
            if mapping.table(table).primary_key.len() != key_arity {
                return Err(Error::mapping(
                    MappingErrorKind::KeyArity,
                    format!(
                        "table '{}' of class '{}' does not share the hierarchy key arity",
                        mapping.table(table).name,
                        def.name
                    ),
                ));
            }

            let join_foreign_key = match (&def.join_foreign_key, parent) {
                (Some(name), Some(parent)) if parent.table != table => {
                    let fk = Self::lookup_foreign_key(mapping, table, name)?;
                    if mapping.foreign_key(fk).referenced_table != parent.table {
                        return Err(Error::mapping(
                            MappingErrorKind::UnknownForeignKey,
                            format!(
                                "join foreign key '{}' must reference '{}'",
                                name,
                                mapping.table(parent.table).name
                            ),
                        ));
                    }
                    Some(fk)
                }
                _ => None,
            };

            if parent.is_some() && (def.version_column.is_some() || def.discriminator_column.is_some())
            {
                return Err(Error::mapping(
                    MappingErrorKind::Duplicate,
                    format!(
                        "class '{}': version and discriminator columns belong to the root class",
                        def.name
                    ),
                ));
            }
            if let Some(col) = &def.version_column {
                Self::require_column(mapping, table, col)?;
            }
            if let Some(col) = &def.discriminator_column {
                Self::require_column(mapping, table, col)?;
            }

            let mut secondary_tables = Vec::new();
            for name in &def.secondary_tables {
                let id = Self::lookup_table(mapping, name)?;
                if mapping.table(id).primary_key.len() != key_arity {
                    return Err(Error::mapping(
                        MappingErrorKind::KeyArity,
                        format!("secondary table '{}' does not share the hierarchy key arity", name),
                    ));
                }
                secondary_tables.push(id);
            }

            let mut fields = Vec::with_capacity(def.fields.len());
            for field in &def.fields {
                let field_table = match &field.table {
                    Some(name) => {
                        let id = Self::lookup_table(mapping, name)?;
                        if id != table && !secondary_tables.contains(&id) {
                            if mapping.table(id).primary_key.len() != key_arity {
                                return Err(Error::mapping(
                                    MappingErrorKind::KeyArity,
                                    format!(
                                        "secondary table '{}' does not share the hierarchy key arity",
                                        name
                                    ),
                                ));
                            }
                            secondary_tables.push(id);
                        }
                        id
                    }
                    None => table,
                };
                let kind = match &field.kind {
                    FieldKindDef::Scalar(column) => {
                        Self::require_column(mapping, field_table, column)?;
                        FieldKind::Scalar {
                            column: column.clone(),
                        }
                    }
                    FieldKindDef::Lob {
                        column,
                        inline_limit,
                    } => {
                        Self::require_column(mapping, field_table, column)?;
                        FieldKind::Lob {
                            column: column.clone(),
                            inline_limit: *inline_limit,
                        }
                    }
                    FieldKindDef::Relation {
                        foreign_key,
                        target,
                    } => FieldKind::Relation {
                        foreign_key: Self::lookup_foreign_key(mapping, field_table, foreign_key)?,
                        target: mapping.class_by_name(target).ok_or_else(|| {
                            Error::mapping(
                                MappingErrorKind::UnknownClass,
                                format!("relation '{}' targets unknown class '{}'", field.name, target),
                            )
                        })?,
                    },
                    FieldKindDef::Custom(strategy) => FieldKind::Custom(Arc::clone(strategy)),
                };
                fields.push(FieldMapping {
                    name: field.name.clone(),
                    table: field_table,
                    kind,
                });
            }

            let field_offset = parent.map_or(0, |p| p.field_offset + p.fields.len());
            resolved[i] = Some(ClassMapping {
                id: ClassId(i),
                name: def.name.clone(),
                superclass,
                table,
                join_foreign_key,
                fields,
                field_offset,
                version_column: def.version_column.clone(),
                discriminator_column: def.discriminator_column.clone(),
                discriminator_value: def.discriminator_value.clone(),
                secondary_tables,
            });
        }

        mapping.classes = resolved.into_iter().flatten().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Mapping {
        MappingBuilder::new()
            .table(
                TableDef::new("people")
                    .column(Column::new("id").auto_assign())
                    .column(Column::new("name"))
                    .column(Column::new("kind"))
                    .column(Column::new("version").not_null())
                    .primary_key(&["id"]),
            )
            .table(
                TableDef::new("students")
                    .column(Column::new("id"))
                    .column(Column::new("grade"))
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_student_person", &["id"], "people")),
            )
            .table(
                TableDef::new("person_bio")
                    .column(Column::new("id"))
                    .column(Column::new("bio"))
                    .primary_key(&["id"]),
            )
            .class(
                ClassDef::new("Person", "people")
                    .version("version")
                    .discriminator("kind")
                    .discriminator_value("person")
                    .field(FieldDef::scalar("name", "name"))
                    .field(FieldDef::scalar("bio", "bio").in_table("person_bio")),
            )
            .class(
                ClassDef::joined("Student", "students", "Person", "fk_student_person")
                    .discriminator_value("student")
                    .field(FieldDef::scalar("grade", "grade")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_hierarchy_and_field_offsets() {
        let m = people();
        let person = m.class_by_name("Person").unwrap();
        let student = m.class_by_name("Student").unwrap();
        assert_eq!(m.hierarchy(student), vec![person, student]);
        assert_eq!(m.root(student), person);
        assert_eq!(m.field_count(student), 3);
        assert_eq!(m.field_index(student, "grade"), Some(2));
        assert_eq!(m.field(student, 1).unwrap().name, "bio");
        assert!(m.class(student).has_own_table(&m));
        assert!(m.class(student).join_foreign_key.is_some());
    }

    #[test]
    fn test_secondary_table_registered() {
        let m = people();
        let person = m.class_by_name("Person").unwrap();
        let bio = m.table_by_name("person_bio").unwrap();
        assert!(m.is_secondary(person, bio));
        assert!(!m.is_secondary(person, m.class(person).table));
    }

    #[test]
    fn test_primary_key_forced_not_null() {
        let m = people();
        let students = m.table(m.table_by_name("students").unwrap());
        assert!(!students.column("id").unwrap().nullable);
        let fk = &students.foreign_keys[0];
        assert!(!fk.nullable);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let err = MappingBuilder::new()
            .class(ClassDef::new("Ghost", "nowhere"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::UnknownTable));
    }

    #[test]
    fn test_key_arity_rejected() {
        let err = MappingBuilder::new()
            .table(
                TableDef::new("a")
                    .column(Column::new("x"))
                    .column(Column::new("y"))
                    .primary_key(&["x", "y"]),
            )
            .table(
                TableDef::new("b")
                    .column(Column::new("id"))
                    .column(Column::new("a_x"))
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_b_a", &["a_x"], "a")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::KeyArity));
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let t = TableDef::new("t").column(Column::new("id")).primary_key(&["id"]);
        let mut a = ClassDef::new("A", "t");
        a.superclass = Some("B".to_string());
        let mut b = ClassDef::new("B", "t");
        b.superclass = Some("A".to_string());
        let err = MappingBuilder::new()
            .table(t)
            .class(a)
            .class(b)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::InheritanceCycle));
    }
}
