//! `MemoryConnection` implementing `sqlwrite_core::Connection`.
//!
//! All state lives behind one `Arc<Mutex<>>`; every operation runs
//! synchronously under the lock and hands back a ready future. Clones share
//! the same store, which lets a test keep a handle for inspection while the
//! flusher borrows another.

use crate::database::MemoryDatabase;
use crate::statement::{self, Statement};
use asupersync::{Cx, Outcome};
use sqlwrite_core::{
    BatchCount, Connection, ConnectionError, ConnectionErrorKind, Error, ExecuteResult,
    PreparedStatement, QueryErrorKind, Result, Value,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// One statement execution attempt, as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Sequence number of the batch this execution belonged to
    pub batch: Option<usize>,
}

#[derive(Debug)]
struct InjectedFailure {
    fragment: String,
    connection: bool,
}

enum Effect {
    Affected(u64),
    Inserted { table: usize, row: Vec<Value> },
    Rows(Vec<Vec<Value>>),
}

impl Effect {
    fn affected(&self) -> u64 {
        match self {
            Effect::Affected(n) => *n,
            Effect::Inserted { .. } => 1,
            Effect::Rows(rows) => rows.len() as u64,
        }
    }
}

#[derive(Debug)]
struct Inner {
    db: MemoryDatabase,
    /// Store contents at the start of the open transaction
    snapshot: Option<MemoryDatabase>,
    statements: HashMap<u64, (String, Statement)>,
    next_statement: u64,
    closed_statements: usize,
    auto_commit: bool,
    batch_reports_no_info: bool,
    batch_stops_on_error: bool,
    failures: Vec<InjectedFailure>,
    log: Vec<ExecutedStatement>,
    batches: usize,
    closed: bool,
}

fn closed_error() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Closed,
        message: "connection is closed".to_string(),
        source: None,
    })
}

impl Inner {
    fn take_failure(&mut self, sql: &str) -> Option<Error> {
        let position = self
            .failures
            .iter()
            .position(|f| sql.contains(&f.fragment))?;
        let failure = self.failures.remove(position);
        let error = if failure.connection {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: format!("connection lost while executing '{}'", failure.fragment),
                source: None,
            })
        } else {
            Error::query(
                QueryErrorKind::Database,
                "HY000",
                format!("injected failure for '{}'", failure.fragment),
            )
            .with_sql(sql)
        };
        Some(error)
    }

    fn begin_write(&mut self) {
        if !self.auto_commit && self.snapshot.is_none() {
            self.snapshot = Some(self.db.clone());
        }
    }

    fn apply(&mut self, sql: &str, statement: &Statement, params: &[Value]) -> Result<Effect> {
        if params.len() < statement.param_count() {
            return Err(Error::query(
                QueryErrorKind::Database,
                "07001",
                format!(
                    "statement expects {} parameters, got {}",
                    statement.param_count(),
                    params.len()
                ),
            )
            .with_sql(sql));
        }
        if let Some(error) = self.take_failure(sql) {
            return Err(error);
        }

        let table = self.db.table_index(statement.table())?;
        let effect = match statement {
            Statement::Insert {
                columns,
                params: slots,
                ..
            } => {
                let assigned = columns
                    .iter()
                    .zip(slots)
                    .map(|(c, p)| Ok((self.db.column(table, c)?, params[*p].clone())))
                    .collect::<Result<Vec<_>>>()?;
                self.begin_write();
                let row = self.db.insert(table, assigned)?;
                Effect::Inserted { table, row }
            }
            Statement::Update {
                assignments,
                filter,
                ..
            } => {
                let assignments = assignments
                    .iter()
                    .map(|(c, p)| Ok((self.db.column(table, c)?, params[*p].clone())))
                    .collect::<Result<Vec<_>>>()?;
                let filter = self.db.resolve_filter(table, filter, params)?;
                self.begin_write();
                Effect::Affected(self.db.update(table, &assignments, &filter)?)
            }
            Statement::Delete { filter, .. } => {
                let filter = self.db.resolve_filter(table, filter, params)?;
                self.begin_write();
                Effect::Affected(self.db.delete(table, &filter)?)
            }
            Statement::Select {
                columns, filter, ..
            } => {
                let columns = columns
                    .iter()
                    .map(|c| self.db.column(table, c))
                    .collect::<Result<Vec<_>>>()?;
                let filter = self.db.resolve_filter(table, filter, params)?;
                let rows = self
                    .db
                    .matching(table, &filter)
                    .into_iter()
                    .map(|i| {
                        let row = &self.db.tables[table].rows[i];
                        columns.iter().map(|c| row[*c].clone()).collect()
                    })
                    .collect();
                Effect::Rows(rows)
            }
        };
        Ok(effect)
    }

    fn execute(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
        batch: Option<usize>,
    ) -> Result<Effect> {
        if self.closed {
            return Err(closed_error());
        }
        let (sql, statement) = self.statements.get(&stmt.id()).cloned().ok_or_else(|| {
            Error::query(
                QueryErrorKind::NotFound,
                "26000",
                format!("prepared statement {} does not exist", stmt.id()),
            )
        })?;
        self.log.push(ExecutedStatement {
            sql: sql.clone(),
            params: params.to_vec(),
            batch,
        });
        let result = self.apply(&sql, &statement, params);
        match &result {
            Ok(effect) => {
                tracing::trace!(sql = %sql, affected = effect.affected(), "Memory statement executed");
            }
            Err(e) => tracing::trace!(sql = %sql, error = %e, "Memory statement failed"),
        }
        result
    }

    fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        if self.closed {
            return Err(closed_error());
        }
        let parsed = statement::parse(sql)?;
        self.next_statement += 1;
        let stmt = PreparedStatement::new(self.next_statement, sql.to_string(), parsed.param_count());
        self.statements
            .insert(self.next_statement, (sql.to_string(), parsed));
        Ok(stmt)
    }

    /// Values of `columns` in the row an INSERT produced.
    fn generated(&self, effect: &Effect, columns: &[String]) -> Result<Vec<Value>> {
        match effect {
            Effect::Inserted { table, row } => columns
                .iter()
                .map(|c| self.db.column(*table, c).map(|i| row[i].clone()))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    fn execute_batch(
        &mut self,
        stmt: &PreparedStatement,
        batch: &[Vec<Value>],
        generated_columns: &[String],
    ) -> Result<Vec<(BatchCount, Vec<Value>)>> {
        self.batches += 1;
        let sequence = self.batches;
        let mut results = Vec::with_capacity(batch.len());
        for params in batch {
            match self.execute(stmt, params, Some(sequence)) {
                Ok(effect) => {
                    let generated = self.generated(&effect, generated_columns)?;
                    let count = if self.batch_reports_no_info {
                        BatchCount::SuccessNoInfo
                    } else {
                        BatchCount::Affected(effect.affected())
                    };
                    results.push((count, generated));
                }
                Err(e) if e.is_connection_error() => return Err(e),
                Err(_) if self.batch_stops_on_error => break,
                Err(_) => results.push((BatchCount::ExecuteFailed, Vec::new())),
            }
        }
        Ok(results)
    }
}

/// Connection to a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDatabase {
    /// Open a connection that owns this store. Starts in auto-commit mode.
    pub fn connect(self) -> MemoryConnection {
        MemoryConnection::new(self)
    }
}

impl MemoryConnection {
    pub fn new(db: MemoryDatabase) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                db,
                snapshot: None,
                statements: HashMap::new(),
                next_statement: 0,
                closed_statements: 0,
                auto_commit: true,
                batch_reports_no_info: false,
                batch_stops_on_error: false,
                failures: Vec::new(),
                log: Vec::new(),
                batches: 0,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report `SuccessNoInfo` instead of row counts from batches.
    pub fn set_batch_reports_no_info(&self, enabled: bool) {
        self.lock().batch_reports_no_info = enabled;
    }

    /// Stop a batch at its first failing statement, returning fewer counts.
    pub fn set_batch_stops_on_error(&self, enabled: bool) {
        self.lock().batch_stops_on_error = enabled;
    }

    /// Fail the next execution whose SQL contains `fragment` with a store error.
    pub fn fail_next(&self, fragment: impl Into<String>) {
        self.lock().failures.push(InjectedFailure {
            fragment: fragment.into(),
            connection: false,
        });
    }

    /// Fail the next execution whose SQL contains `fragment` with a
    /// connection error.
    pub fn fail_connection_next(&self, fragment: impl Into<String>) {
        self.lock().failures.push(InjectedFailure {
            fragment: fragment.into(),
            connection: true,
        });
    }

    /// Every execution attempt so far, in order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.lock().log.clone()
    }

    /// SQL of every execution attempt so far, in order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().log.iter().map(|e| e.sql.clone()).collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Number of `execute_batch` calls.
    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }

    /// Prepared statements not yet closed.
    pub fn open_statements(&self) -> usize {
        self.lock().statements.len()
    }

    pub fn closed_statements(&self) -> usize {
        self.lock().closed_statements
    }

    /// Insert a row directly, committed immediately.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> Result<Vec<Value>> {
        let mut inner = self.lock();
        let index = inner.db.table_index(table)?;
        let assigned = values
            .iter()
            .map(|(c, v)| Ok((inner.db.column(index, c)?, v.clone())))
            .collect::<Result<Vec<_>>>()?;
        let row = inner.db.insert(index, assigned)?;
        if let Some(snapshot) = inner.snapshot.as_mut() {
            snapshot.insert(index, row.iter().cloned().enumerate().collect())?;
        }
        Ok(row)
    }

    /// Make the open transaction's changes permanent.
    pub fn commit(&self) {
        self.lock().snapshot = None;
    }

    /// Discard every change since the open transaction began.
    pub fn rollback(&self) {
        let mut inner = self.lock();
        if let Some(snapshot) = inner.snapshot.take() {
            inner.db = snapshot;
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// A copy of the current store contents.
    pub fn database(&self) -> MemoryDatabase {
        self.lock().db.clone()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().db.row_count(table).unwrap_or(0)
    }

    pub fn value(&self, table: &str, key: &[Value], column: &str) -> Option<Value> {
        self.lock().db.value(table, key, column)
    }

    pub fn contains(&self, table: &str, key: &[Value]) -> bool {
        self.lock().db.contains(table, key)
    }
}

impl Connection for MemoryConnection {
    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        let result = self.lock().prepare(sql);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self
            .lock()
            .execute(stmt, params, None)
            .map(|effect| effect.affected());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_returning(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
        generated_columns: &[String],
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send {
        let mut inner = self.lock();
        let result = inner.execute(stmt, params, None).and_then(|effect| {
            Ok(ExecuteResult {
                affected: effect.affected(),
                generated: inner.generated(&effect, generated_columns)?,
            })
        });
        drop(inner);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_batch(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        batch: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<BatchCount>, Error>> + Send {
        let result = self
            .lock()
            .execute_batch(stmt, batch, &[])
            .map(|results| results.into_iter().map(|(count, _)| count).collect());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute_batch_returning(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        batch: &[Vec<Value>],
        generated_columns: &[String],
    ) -> impl Future<Output = Outcome<Vec<(BatchCount, Vec<Value>)>, Error>> + Send {
        let result = self.lock().execute_batch(stmt, batch, generated_columns);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Vec<Value>>, Error>> + Send {
        let result = self
            .lock()
            .execute(stmt, params, None)
            .and_then(|effect| match effect {
                Effect::Rows(rows) => Ok(rows),
                _ => Err(Error::query(
                    QueryErrorKind::Database,
                    "42000",
                    "statement does not return rows",
                )
                .with_sql(stmt.sql())),
            });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn close_statement(
        &self,
        _cx: &Cx,
        stmt: PreparedStatement,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut inner = self.lock();
        if inner.statements.remove(&stmt.id()).is_some() {
            inner.closed_statements += 1;
        }
        drop(inner);
        async move { Outcome::Ok(()) }
    }

    fn auto_commit(&self) -> bool {
        self.lock().auto_commit
    }

    fn set_auto_commit(
        &self,
        _cx: &Cx,
        enabled: bool,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut inner = self.lock();
        let result = if inner.closed {
            Err(closed_error())
        } else {
            if enabled {
                inner.snapshot = None;
            }
            inner.auto_commit = enabled;
            tracing::debug!(enabled, "Memory auto-commit changed");
            Ok(())
        };
        drop(inner);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = Result<()>> + Send {
        let mut inner = self.lock();
        inner.closed = true;
        inner.statements.clear();
        drop(inner);
        async move { Ok(()) }
    }
}
