//! Database connection contract consumed by the flush engine.
//!
//! The engine never manages connections itself. It borrows one connection for
//! the duration of a flush and drives it through this trait:
//!
//! - [`Connection::prepare`] / [`Connection::close_statement`] for statement lifecycle
//! - [`Connection::execute_prepared`] and [`Connection::execute_returning`] for single rows
//! - [`Connection::execute_batch`] for homogeneous runs of rows
//! - [`Connection::query_prepared`] for version checks
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::error::Result;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// A prepared statement for repeated execution.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Unique identifier for this prepared statement (driver-specific)
    id: u64,
    /// The original SQL text
    sql: String,
    /// Number of expected parameters
    param_count: usize,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    ///
    /// This is typically called by the driver, not by users directly.
    #[must_use]
    pub fn new(id: u64, sql: String, param_count: usize) -> Self {
        Self {
            id,
            sql,
            param_count,
        }
    }

    /// Get the statement ID.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Get the original SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the expected number of parameters.
    #[must_use]
    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    /// Check if the provided parameters match the expected count.
    #[must_use]
    pub fn validate_params(&self, params: &[Value]) -> bool {
        params.len() == self.param_count
    }
}

/// Per-statement result code of a batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCount {
    /// The statement affected this many rows.
    Affected(u64),
    /// The statement succeeded but the driver reports no row count.
    SuccessNoInfo,
    /// The statement failed; the driver kept executing the rest.
    ExecuteFailed,
}

/// Result of a single execution that reads back generated values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    /// Rows affected by the statement.
    pub affected: u64,
    /// Generated values, in the order the columns were requested.
    pub generated: Vec<Value>,
}

/// A database connection capable of executing flush statements.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Example
///
/// ```rust,ignore
/// let stmt = conn.prepare(&cx, "UPDATE \"heroes\" SET \"name\" = $1 WHERE \"id\" = $2").await?;
/// let affected = conn.execute_prepared(&cx, &stmt, &[Value::from("Thor"), Value::BigInt(1)]).await?;
/// conn.close_statement(&cx, stmt).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Prepare a statement for one or more executions.
    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, crate::Error>> + Send;

    /// Execute a prepared statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute a prepared INSERT and read back the named generated columns.
    fn execute_returning(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
        generated_columns: &[String],
    ) -> impl Future<Output = Outcome<ExecuteResult, crate::Error>> + Send;

    /// Execute one prepared statement once per parameter set.
    ///
    /// Returns one [`BatchCount`] per parameter set, in order. A driver that
    /// aborts the whole batch returns `Outcome::Err` instead.
    fn execute_batch(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        batch: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<BatchCount>, crate::Error>> + Send;

    /// Execute a batched INSERT and read back the named generated columns of
    /// every parameter set.
    ///
    /// Positions line up with `batch`. A failed position carries no values.
    fn execute_batch_returning(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        batch: &[Vec<Value>],
        generated_columns: &[String],
    ) -> impl Future<Output = Outcome<Vec<(BatchCount, Vec<Value>)>, crate::Error>> + Send;

    /// Execute a prepared query and return every row as a list of values.
    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Vec<Value>>, crate::Error>> + Send;

    /// Release a prepared statement.
    fn close_statement(
        &self,
        cx: &Cx,
        stmt: PreparedStatement,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Whether every statement commits on its own.
    fn auto_commit(&self) -> bool;

    /// Toggle auto-commit mode.
    fn set_auto_commit(
        &self,
        cx: &Cx,
        enabled: bool,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Close the connection gracefully.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_statement_new() {
        let stmt = PreparedStatement::new(1, "DELETE FROM \"t\" WHERE \"id\" = $1".to_string(), 1);
        assert_eq!(stmt.id(), 1);
        assert_eq!(stmt.sql(), "DELETE FROM \"t\" WHERE \"id\" = $1");
        assert_eq!(stmt.param_count(), 1);
    }

    #[test]
    fn test_prepared_statement_validate_params() {
        let stmt = PreparedStatement::new(1, "SELECT $1, $2".to_string(), 2);

        assert!(!stmt.validate_params(&[]));
        assert!(!stmt.validate_params(&[Value::Int(1)]));
        assert!(stmt.validate_params(&[Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_execute_result_default() {
        let result = ExecuteResult::default();
        assert_eq!(result.affected, 0);
        assert!(result.generated.is_empty());
    }
}
