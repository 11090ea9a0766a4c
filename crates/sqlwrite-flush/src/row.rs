//! The row model: one pending SQL statement against one table.
//!
//! Rows are created during collection, adjusted by the orderer and consumed
//! exactly once by the executor. Foreign keys toward other managed objects are
//! kept symbolically (`foreign_keys_set`) and resolved to column values at bind
//! time, so keys generated earlier in the same flush are visible.

use sqlwrite_core::{Action, ForeignKey, ForeignKeyId, ObjectId, TableId, Value};

/// Position of a row inside its [`RowManager`](crate::RowManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub(crate) usize);

impl RowId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Which part of an object's persistent state a row writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    /// Root table or joined subclass table of an entity.
    Primary,
    /// Secondary table joined on the identity key.
    Secondary,
    /// Bulk statement over any number of rows; no owner, count unchecked.
    AllRows,
}

/// One pending statement.
#[derive(Debug, Clone)]
pub struct Row {
    table: TableId,
    action: Action,
    owner: Option<ObjectId>,
    kind: RowKind,
    /// Discovery sequence; tie-break and happens-before proxy
    index: usize,
    set: Vec<(String, Value)>,
    where_: Vec<(String, Value)>,
    key_where: bool,
    valid: bool,
    failed_object: Option<ObjectId>,
    foreign_keys_set: Vec<(ForeignKeyId, ObjectId)>,
    foreign_keys_where: Vec<(ForeignKeyId, ObjectId)>,
}

impl Row {
    pub fn new(
        table: TableId,
        action: Action,
        owner: Option<ObjectId>,
        kind: RowKind,
        index: usize,
    ) -> Self {
        Self {
            table,
            action,
            owner,
            kind,
            index,
            set: Vec::new(),
            where_: Vec::new(),
            key_where: false,
            valid: true,
            failed_object: None,
            foreign_keys_set: Vec::new(),
            foreign_keys_where: Vec::new(),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn owner(&self) -> Option<ObjectId> {
        self.owner
    }

    pub fn kind(&self) -> RowKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Assign a column. Assigning a column twice keeps the latest value.
    pub fn set_column(&mut self, column: &str, value: Value) {
        match self.set.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.set.push((column.to_string(), value)),
        }
    }

    /// Remove a column assignment.
    pub fn remove_column(&mut self, column: &str) {
        self.set.retain(|(c, _)| c != column);
    }

    /// Match a column in the WHERE clause.
    pub fn where_column(&mut self, column: &str, value: Value) {
        match self.where_.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.where_.push((column.to_string(), value)),
        }
    }

    pub fn set_values(&self) -> &[(String, Value)] {
        &self.set
    }

    pub fn where_values(&self) -> &[(String, Value)] {
        &self.where_
    }

    /// Locate the row by the owner's identity key, resolved at bind time.
    pub fn set_key_where(&mut self, enabled: bool) {
        self.key_where = enabled;
    }

    pub fn uses_key_where(&self) -> bool {
        self.key_where
    }

    /// If this row does not affect exactly one row, `object` failed an
    /// optimistic lock.
    pub fn set_failed_object(&mut self, object: Option<ObjectId>) {
        self.failed_object = object;
    }

    pub fn failed_object(&self) -> Option<ObjectId> {
        self.failed_object
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Assign a foreign key. `Some` binds the target's identity at execution,
    /// `None` writes NULL into every column of the key.
    pub fn set_foreign_key(&mut self, id: ForeignKeyId, fk: &ForeignKey, target: Option<ObjectId>) {
        self.foreign_keys_set.retain(|(k, _)| *k != id);
        match target {
            Some(target) => {
                for column in &fk.columns {
                    self.remove_column(column);
                }
                self.foreign_keys_set.push((id, target));
            }
            None => {
                for column in &fk.columns {
                    self.set_column(column, Value::Null);
                }
            }
        }
    }

    /// Record that this row references `target` through `id` without assigning it.
    pub fn where_foreign_key(&mut self, id: ForeignKeyId, target: ObjectId) {
        self.foreign_keys_where.retain(|(k, _)| *k != id);
        self.foreign_keys_where.push((id, target));
    }

    /// Drop a foreign key assignment.
    ///
    /// An INSERT writes NULL instead; an UPDATE left with nothing to assign
    /// becomes invalid.
    pub fn clear_foreign_key(&mut self, id: ForeignKeyId, fk: &ForeignKey) {
        self.foreign_keys_set.retain(|(k, _)| *k != id);
        match self.action {
            Action::Insert => {
                for column in &fk.columns {
                    self.set_column(column, Value::Null);
                }
            }
            Action::Update => {
                for column in &fk.columns {
                    self.remove_column(column);
                }
                if !self.has_assignments() {
                    self.valid = false;
                }
            }
            Action::Delete => {}
        }
    }

    pub fn foreign_keys_set(&self) -> &[(ForeignKeyId, ObjectId)] {
        &self.foreign_keys_set
    }

    pub fn foreign_keys_where(&self) -> &[(ForeignKeyId, ObjectId)] {
        &self.foreign_keys_where
    }

    /// Target of the assigned foreign key `id`, if any.
    pub fn foreign_key_target(&self, id: ForeignKeyId) -> Option<ObjectId> {
        self.foreign_keys_set
            .iter()
            .find(|(k, _)| *k == id)
            .map(|(_, t)| *t)
    }

    pub fn has_assignments(&self) -> bool {
        !self.set.is_empty() || !self.foreign_keys_set.is_empty()
    }
}

/// A pending `LockIntent::Check` verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub owner: ObjectId,
    pub table: TableId,
    pub expected: Option<i64>,
}
