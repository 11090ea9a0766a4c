//! SQL dialect abstraction for rendering rows.
//!
//! A [`Dialect`] decides placeholder and identifier syntax, renders bound
//! rows into statement text and tells the executor whether (and how far) it
//! may batch.

use serde::{Deserialize, Serialize};
use sqlwrite_core::{Action, Table, Value};

/// A row with every column value resolved, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundRow {
    pub table: String,
    pub action: Action,
    /// Assignments in column order
    pub set: Vec<(String, Value)>,
    /// Matches; a NULL value renders as `IS NULL`
    pub where_: Vec<(String, Value)>,
}

impl BoundRow {
    pub fn new(table: impl Into<String>, action: Action) -> Self {
        Self {
            table: table.into(),
            action,
            set: Vec::new(),
            where_: Vec::new(),
        }
    }

    /// Assign a column, replacing an earlier assignment of the same column.
    pub fn set(&mut self, column: &str, value: Value) {
        match self.set.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.set.push((column.to_string(), value)),
        }
    }

    pub fn matches(&mut self, column: &str, value: Value) {
        match self.where_.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.where_.push((column.to_string(), value)),
        }
    }

    /// Parameters in binding order: SET values, then non-null WHERE values.
    pub fn params(&self) -> Vec<Value> {
        let set = self.set.iter().map(|(_, v)| v.clone());
        let matches = self
            .where_
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(_, v)| v.clone());
        match self.action {
            Action::Delete => matches.collect(),
            _ => set.chain(matches).collect(),
        }
    }
}

/// Database vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DialectKind {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Placeholder for the given parameter index (1-based).
    fn placeholder(&self, index: usize) -> String {
        match self.kind() {
            DialectKind::Postgres => format!("${index}"),
            DialectKind::Sqlite => format!("?{index}"),
            DialectKind::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    fn quote_identifier(&self, name: &str) -> String {
        match self.kind() {
            DialectKind::Postgres | DialectKind::Sqlite => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            DialectKind::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Render a bound row into SQL text.
    fn render(&self, row: &BoundRow) -> String {
        let table = self.quote_identifier(&row.table);
        let mut param = 0;
        let mut next = || {
            param += 1;
            self.placeholder(param)
        };

        let mut sql = match row.action {
            Action::Insert => {
                if row.set.is_empty() {
                    return match self.kind() {
                        DialectKind::Mysql => format!("INSERT INTO {} () VALUES ()", table),
                        _ => format!("INSERT INTO {} DEFAULT VALUES", table),
                    };
                }
                let columns: Vec<String> = row
                    .set
                    .iter()
                    .map(|(c, _)| self.quote_identifier(c))
                    .collect();
                let values: Vec<String> = row.set.iter().map(|_| next()).collect();
                return format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    values.join(", ")
                );
            }
            Action::Update => {
                let assignments: Vec<String> = row
                    .set
                    .iter()
                    .map(|(c, _)| format!("{} = {}", self.quote_identifier(c), next()))
                    .collect();
                format!("UPDATE {} SET {}", table, assignments.join(", "))
            }
            Action::Delete => format!("DELETE FROM {}", table),
        };

        if !row.where_.is_empty() {
            let conditions: Vec<String> = row
                .where_
                .iter()
                .map(|(c, v)| {
                    if v.is_null() {
                        format!("{} IS NULL", self.quote_identifier(c))
                    } else {
                        format!("{} = {}", self.quote_identifier(c), next())
                    }
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql
    }

    /// `SELECT version_column FROM table WHERE <primary key>`.
    fn select_version_sql(&self, table: &Table, version_column: &str) -> String {
        let conditions: Vec<String> = table
            .primary_key
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_identifier(c), self.placeholder(i + 1)))
            .collect();
        format!(
            "SELECT {} FROM {} WHERE {}",
            self.quote_identifier(version_column),
            self.quote_identifier(&table.name),
            conditions.join(" AND ")
        )
    }

    /// Rows per batch: `-1` unlimited, `0` disables batching.
    fn batch_limit(&self) -> i32;

    /// Whether generated keys can be read back from a batch.
    fn supports_batch_generated_keys(&self) -> bool {
        false
    }

    /// Whether `row` may join a batch.
    ///
    /// Inserts that may read back generated values are refused unless the
    /// dialect supports generated keys inside a batch.
    fn validate_batch(&self, row: &BoundRow, table: &Table) -> bool {
        row.action != Action::Insert
            || self.supports_batch_generated_keys()
            || table
                .auto_assign_columns()
                .all(|c| row.set.iter().any(|(name, _)| *name == c.name))
    }
}

/// The built-in dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardDialect {
    kind: DialectKind,
    batch_limit: i32,
    batch_generated_keys: bool,
}

impl StandardDialect {
    pub fn new(kind: DialectKind) -> Self {
        let batch_limit = match kind {
            DialectKind::Postgres | DialectKind::Mysql => 100,
            DialectKind::Sqlite => -1,
        };
        Self {
            kind,
            batch_limit,
            batch_generated_keys: false,
        }
    }

    pub fn postgres() -> Self {
        Self::new(DialectKind::Postgres)
    }

    pub fn sqlite() -> Self {
        Self::new(DialectKind::Sqlite)
    }

    pub fn mysql() -> Self {
        Self::new(DialectKind::Mysql)
    }

    pub fn with_batch_limit(mut self, limit: i32) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_batch_generated_keys(mut self, enabled: bool) -> Self {
        self.batch_generated_keys = enabled;
        self
    }
}

impl Default for StandardDialect {
    fn default() -> Self {
        Self::postgres()
    }
}

impl Dialect for StandardDialect {
    fn kind(&self) -> DialectKind {
        self.kind
    }

    fn batch_limit(&self) -> i32 {
        self.batch_limit
    }

    fn supports_batch_generated_keys(&self) -> bool {
        self.batch_generated_keys
    }
}
