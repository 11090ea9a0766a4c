//! Tables and constraint enforcement for the in-memory store.

use crate::statement::Condition;
use sqlwrite_core::{Error, Mapping, QueryErrorKind, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct MemoryColumn {
    pub name: String,
    pub nullable: bool,
    pub auto_assign: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryForeignKey {
    pub name: String,
    pub columns: Vec<usize>,
    pub referenced: usize,
    pub deferred: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryTable {
    pub name: String,
    pub columns: Vec<MemoryColumn>,
    pub primary_key: Vec<usize>,
    pub foreign_keys: Vec<MemoryForeignKey>,
    pub rows: Vec<Vec<Value>>,
    pub sequence: i64,
}

impl MemoryTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn key_of(&self, row: &[Value]) -> Vec<Value> {
        self.primary_key.iter().map(|i| row[*i].clone()).collect()
    }

    fn find_key(&self, key: &[Value]) -> Option<usize> {
        self.rows.iter().position(|row| {
            self.primary_key
                .iter()
                .zip(key)
                .all(|(i, v)| row[*i].loosely_equals(v))
        })
    }
}

/// An in-memory relational store built from a mapping's schema facts.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    pub(crate) tables: Vec<MemoryTable>,
    by_name: HashMap<String, usize>,
}

fn violation(kind: QueryErrorKind, sqlstate: &str, message: String) -> Error {
    Error::query(kind, sqlstate, message)
}

fn matches(row: &[Value], filter: &[(usize, Option<Value>)]) -> bool {
    filter.iter().all(|(column, expected)| match expected {
        // `IS NULL`
        None => row[*column].is_null(),
        // `= NULL` never matches
        Some(Value::Null) => false,
        Some(value) => !row[*column].is_null() && row[*column].loosely_equals(value),
    })
}

impl MemoryDatabase {
    pub fn new(mapping: &Mapping) -> Self {
        let tables: Vec<MemoryTable> = mapping
            .tables()
            .iter()
            .map(|t| {
                let columns: Vec<MemoryColumn> = t
                    .columns
                    .iter()
                    .map(|c| MemoryColumn {
                        name: c.name.clone(),
                        nullable: c.nullable,
                        auto_assign: c.auto_assign,
                    })
                    .collect();
                let position =
                    |name: &str| columns.iter().position(|c| c.name == name).unwrap_or(0);
                let primary_key = t.primary_key.iter().map(|c| position(c)).collect();
                let foreign_keys = t
                    .foreign_keys
                    .iter()
                    .map(|fk| MemoryForeignKey {
                        name: fk.name.clone(),
                        columns: fk.columns.iter().map(|c| position(c)).collect(),
                        referenced: fk.referenced_table.index(),
                        deferred: fk.deferred,
                    })
                    .collect();
                MemoryTable {
                    name: t.name.clone(),
                    columns,
                    primary_key,
                    foreign_keys,
                    rows: Vec::new(),
                    sequence: 0,
                }
            })
            .collect();
        let by_name = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self { tables, by_name }
    }

    pub(crate) fn table_index(&self, name: &str) -> Result<usize, Error> {
        self.by_name.get(name).copied().ok_or_else(|| {
            violation(
                QueryErrorKind::NotFound,
                "42P01",
                format!("table '{}' does not exist", name),
            )
        })
    }

    pub(crate) fn column(&self, table: usize, name: &str) -> Result<usize, Error> {
        self.tables[table].column_index(name).ok_or_else(|| {
            violation(
                QueryErrorKind::NotFound,
                "42703",
                format!("column '{}' does not exist in '{}'", name, self.tables[table].name),
            )
        })
    }

    /// Resolve a parsed filter against bound parameters.
    pub(crate) fn resolve_filter(
        &self,
        table: usize,
        filter: &[Condition],
        params: &[Value],
    ) -> Result<Vec<(usize, Option<Value>)>, Error> {
        filter
            .iter()
            .map(|c| {
                let column = self.column(table, &c.column)?;
                let value = c.param.map(|p| params.get(p).cloned().unwrap_or(Value::Null));
                Ok((column, value))
            })
            .collect()
    }

    pub(crate) fn matching(&self, table: usize, filter: &[(usize, Option<Value>)]) -> Vec<usize> {
        let t = &self.tables[table];
        (0..t.rows.len())
            .filter(|i| matches(&t.rows[*i], filter))
            .collect()
    }

    /// Number of rows in `table`, or `None` if the table does not exist.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.by_name.get(table).map(|i| self.tables[*i].rows.len())
    }

    /// Every row of `table` as `(column, value)` pairs.
    pub fn rows(&self, table: &str) -> Vec<Vec<(String, Value)>> {
        let Some(index) = self.by_name.get(table) else {
            return Vec::new();
        };
        let t = &self.tables[*index];
        t.rows
            .iter()
            .map(|row| {
                t.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    /// The value of `column` in the row of `table` with primary key `key`.
    pub fn value(&self, table: &str, key: &[Value], column: &str) -> Option<Value> {
        let t = &self.tables[*self.by_name.get(table)?];
        let column = t.column_index(column)?;
        t.find_key(key).map(|row| t.rows[row][column].clone())
    }

    /// Whether `table` holds a row with primary key `key`.
    pub fn contains(&self, table: &str, key: &[Value]) -> bool {
        self.by_name
            .get(table)
            .is_some_and(|t| self.tables[*t].find_key(key).is_some())
    }

    fn check_row(&self, table: usize, row: &[Value], replacing: Option<usize>) -> Result<(), Error> {
        let t = &self.tables[table];
        for (column, value) in t.columns.iter().zip(row) {
            if !column.nullable && value.is_null() {
                return Err(violation(
                    QueryErrorKind::NotNull,
                    "23502",
                    format!("null value in column '{}' of '{}'", column.name, t.name),
                ));
            }
        }

        let key = t.key_of(row);
        let duplicate = t
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != replacing)
            .any(|(_, other)| {
                t.primary_key
                    .iter()
                    .zip(&key)
                    .all(|(i, v)| other[*i].loosely_equals(v))
            });
        if duplicate {
            return Err(violation(
                QueryErrorKind::UniqueViolation,
                "23505",
                format!("duplicate primary key in '{}'", t.name),
            ));
        }

        for fk in t.foreign_keys.iter().filter(|fk| !fk.deferred) {
            let values: Vec<Value> = fk.columns.iter().map(|i| row[*i].clone()).collect();
            if values.iter().any(Value::is_null) {
                continue;
            }
            let referenced = &self.tables[fk.referenced];
            let references_itself = fk.referenced == table
                && values.iter().zip(&key).all(|(a, b)| a.loosely_equals(b));
            if !references_itself && referenced.find_key(&values).is_none() {
                return Err(violation(
                    QueryErrorKind::ForeignKey,
                    "23503",
                    format!(
                        "insert or update on '{}' violates foreign key '{}'",
                        t.name, fk.name
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Fail if any row outside `removed` references `key` of `table`
    /// through an immediate foreign key.
    fn check_unreferenced(
        &self,
        table: usize,
        key: &[Value],
        removed: &[(usize, usize)],
    ) -> Result<(), Error> {
        for (index, t) in self.tables.iter().enumerate() {
            for fk in t.foreign_keys.iter().filter(|fk| !fk.deferred && fk.referenced == table) {
                let referencing = t.rows.iter().enumerate().any(|(row_index, row)| {
                    !removed.contains(&(index, row_index))
                        && fk
                            .columns
                            .iter()
                            .zip(key)
                            .all(|(i, v)| !row[*i].is_null() && row[*i].loosely_equals(v))
                });
                if referencing {
                    return Err(violation(
                        QueryErrorKind::ForeignKey,
                        "23503",
                        format!(
                            "row of '{}' is still referenced from '{}' by '{}'",
                            self.tables[table].name, t.name, fk.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Insert a row, generating auto-assigned columns left unset.
    ///
    /// Returns the stored row.
    pub(crate) fn insert(
        &mut self,
        table: usize,
        assigned: Vec<(usize, Value)>,
    ) -> Result<Vec<Value>, Error> {
        let t = &self.tables[table];
        let mut row = vec![Value::Null; t.columns.len()];
        let mut provided = vec![false; t.columns.len()];
        for (column, value) in assigned {
            row[column] = value;
            provided[column] = true;
        }

        let mut sequence = t.sequence;
        for (i, column) in t.columns.iter().enumerate() {
            if !column.auto_assign {
                continue;
            }
            if provided[i] {
                if let Some(v) = row[i].as_i64() {
                    sequence = sequence.max(v);
                }
            } else {
                sequence += 1;
                row[i] = Value::BigInt(sequence);
            }
        }

        self.check_row(table, &row, None)?;
        let t = &mut self.tables[table];
        t.sequence = sequence;
        t.rows.push(row.clone());
        Ok(row)
    }

    /// Apply assignments to every row matching `filter`, all or nothing.
    pub(crate) fn update(
        &mut self,
        table: usize,
        assignments: &[(usize, Value)],
        filter: &[(usize, Option<Value>)],
    ) -> Result<u64, Error> {
        let targets = self.matching(table, filter);
        let t = &self.tables[table];
        let updated: Vec<(usize, Vec<Value>)> = targets
            .iter()
            .map(|i| {
                let mut row = t.rows[*i].clone();
                for (column, value) in assignments {
                    row[*column] = value.clone();
                }
                (*i, row)
            })
            .collect();

        for (index, row) in &updated {
            self.check_row(table, row, Some(*index))?;
            let old_key = self.tables[table].key_of(&self.tables[table].rows[*index]);
            let new_key = self.tables[table].key_of(row);
            let key_changed = old_key.iter().zip(&new_key).any(|(a, b)| !a.loosely_equals(b));
            if key_changed {
                self.check_unreferenced(table, &old_key, &[(table, *index)])?;
            }
        }

        let t = &mut self.tables[table];
        for (index, row) in updated {
            t.rows[index] = row;
        }
        Ok(targets.len() as u64)
    }

    /// Delete every row matching `filter`, all or nothing.
    pub(crate) fn delete(
        &mut self,
        table: usize,
        filter: &[(usize, Option<Value>)],
    ) -> Result<u64, Error> {
        let targets = self.matching(table, filter);
        let removed: Vec<(usize, usize)> = targets.iter().map(|i| (table, *i)).collect();
        for index in &targets {
            let key = self.tables[table].key_of(&self.tables[table].rows[*index]);
            self.check_unreferenced(table, &key, &removed)?;
        }
        let t = &mut self.tables[table];
        for index in targets.iter().rev() {
            t.rows.remove(*index);
        }
        Ok(targets.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwrite_core::{Column, ForeignKeyDef, MappingBuilder, TableDef};

    fn db() -> MemoryDatabase {
        let mapping = MappingBuilder::new()
            .table(
                TableDef::new("teams")
                    .column(Column::new("id").auto_assign())
                    .column(Column::new("name").not_null())
                    .primary_key(&["id"]),
            )
            .table(
                TableDef::new("heroes")
                    .column(Column::new("id"))
                    .column(Column::new("team_id"))
                    .column(Column::new("mentor_id"))
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_team", &["team_id"], "teams"))
                    .foreign_key(ForeignKeyDef::new("fk_mentor", &["mentor_id"], "heroes")),
            )
            .build()
            .unwrap();
        MemoryDatabase::new(&mapping)
    }

    #[test]
    fn test_insert_generates_keys() {
        let mut db = db();
        let teams = db.table_index("teams").unwrap();
        let row = db.insert(teams, vec![(1, Value::from("A"))]).unwrap();
        assert_eq!(row[0], Value::BigInt(1));
        db.insert(teams, vec![(0, Value::BigInt(10)), (1, Value::from("B"))]).unwrap();
        let row = db.insert(teams, vec![(1, Value::from("C"))]).unwrap();
        assert_eq!(row[0], Value::BigInt(11));
        assert_eq!(db.row_count("teams"), Some(3));
    }

    #[test]
    fn test_constraints_on_insert() {
        let mut db = db();
        let teams = db.table_index("teams").unwrap();
        let heroes = db.table_index("heroes").unwrap();

        let err = db.insert(teams, vec![]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23502"));

        let err = db.insert(heroes, vec![(0, Value::BigInt(1)), (1, Value::BigInt(9))]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23503"));

        db.insert(heroes, vec![(0, Value::BigInt(1))]).unwrap();
        let err = db.insert(heroes, vec![(0, Value::Int(1))]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23505"));
    }

    #[test]
    fn test_self_reference_to_own_row() {
        let mut db = db();
        let heroes = db.table_index("heroes").unwrap();
        db.insert(heroes, vec![(0, Value::BigInt(1)), (2, Value::BigInt(1))]).unwrap();
        assert_eq!(db.value("heroes", &[Value::BigInt(1)], "mentor_id"), Some(Value::BigInt(1)));
    }

    #[test]
    fn test_delete_of_referenced_row_fails() {
        let mut db = db();
        let teams = db.table_index("teams").unwrap();
        let heroes = db.table_index("heroes").unwrap();
        db.insert(teams, vec![(1, Value::from("A"))]).unwrap();
        db.insert(heroes, vec![(0, Value::BigInt(1)), (1, Value::BigInt(1))]).unwrap();

        let by_id = [(0, Some(Value::BigInt(1)))];
        let err = db.delete(teams, &by_id).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23503"));

        assert_eq!(db.update(heroes, &[(1, Value::Null)], &by_id).unwrap(), 1);
        assert_eq!(db.delete(teams, &by_id).unwrap(), 1);
        assert_eq!(db.row_count("teams"), Some(0));
    }

    #[test]
    fn test_null_filters() {
        let mut db = db();
        let heroes = db.table_index("heroes").unwrap();
        db.insert(heroes, vec![(0, Value::BigInt(1))]).unwrap();
        assert_eq!(db.matching(heroes, &[(1, None)]), vec![0]);
        assert!(db.matching(heroes, &[(1, Some(Value::Null))]).is_empty());
    }
}
