//! Resolved table, column and foreign key facts.
//!
//! These are the relational half of a [`Mapping`](crate::mapping::Mapping).
//! Everything here is immutable once the mapping is built; ids are indexes
//! into the owning mapping.

use std::fmt;

/// Index of a table inside a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub(crate) usize);

impl TableId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the table in [`Mapping::tables`](crate::mapping::Mapping::tables).
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A foreign key, addressed by its owning table and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyId {
    pub(crate) table: TableId,
    pub(crate) index: usize,
}

impl ForeignKeyId {
    /// The table that holds the foreign key columns.
    pub const fn table(self) -> TableId {
        self.table
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Whether NULL is accepted
    pub nullable: bool,
    /// Whether the store generates the value on insert
    pub auto_assign: bool,
}

impl Column {
    /// A nullable, store-neutral column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            auto_assign: false,
        }
    }

    /// Reject NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Let the store generate the value on insert.
    pub fn auto_assign(mut self) -> Self {
        self.auto_assign = true;
        self.nullable = false;
        self
    }
}

/// A resolved foreign key.
///
/// `columns[i]` references the i-th primary key column of `referenced_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Constraint name, unique within the mapping
    pub name: String,
    /// Local columns, in referenced primary key order
    pub columns: Vec<String>,
    /// Table whose primary key is referenced
    pub referenced_table: TableId,
    /// All local columns accept NULL
    pub nullable: bool,
    /// Logical or deferrable: the store does not check it per statement
    pub deferred: bool,
}

impl ForeignKey {
    /// Whether this key imposes an ordering constraint between statements.
    pub fn constrains_order(&self) -> bool {
        !self.nullable && !self.deferred
    }
}

/// A resolved table.
#[derive(Debug, Clone)]
pub struct Table {
    /// Table id within the mapping
    pub id: TableId,
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub columns: Vec<Column>,
    /// Primary key columns; position i holds identity key component i
    pub primary_key: Vec<String>,
    /// Foreign keys declared on this table
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns the store generates on insert.
    pub fn auto_assign_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.auto_assign)
    }

    /// Position of `column` in the primary key, if it is part of it.
    pub fn primary_key_position(&self, column: &str) -> Option<usize> {
        self.primary_key.iter().position(|c| c == column)
    }

    /// Id of the foreign key at `index`.
    pub fn foreign_key_id(&self, index: usize) -> ForeignKeyId {
        ForeignKeyId {
            table: self.id,
            index,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_builders() {
        let c = Column::new("id").auto_assign();
        assert!(c.auto_assign);
        assert!(!c.nullable);

        let c = Column::new("team_id");
        assert!(c.nullable);
        assert!(!Column::new("x").not_null().nullable);
    }

    #[test]
    fn test_constrains_order() {
        let mut fk = ForeignKey {
            name: "fk".to_string(),
            columns: vec!["team_id".to_string()],
            referenced_table: TableId(0),
            nullable: false,
            deferred: false,
        };
        assert!(fk.constrains_order());
        fk.deferred = true;
        assert!(!fk.constrains_order());
        fk.deferred = false;
        fk.nullable = true;
        assert!(!fk.constrains_order());
    }
}
