//! Statement executor: binds rows, batches them and reconciles results.
//!
//! Rows are executed one at a time unless the dialect allows batching; a
//! batch collects consecutive rows rendering to the same SQL text. Per-row
//! failures are accumulated and only connection-class errors abort.

use crate::dialect::{BoundRow, Dialect};
use crate::flush::{FlushConfig, FlushStats};
use crate::orderer::FlushOrder;
use crate::row::{Row, RowId, RowKind, VersionCheck};
use crate::row_manager::{PendingCustom, RowManager};
use crate::unit_of_work::UnitOfWork;
use asupersync::{Cx, Outcome};
use sqlwrite_core::{
    Action, BatchCount, ClassId, Connection, CustomOperation, Error, FieldKind, FieldValue,
    InternalError, Mapping, ObjectId, ObjectState, OptimisticLockError, PreparedStatement,
    QueryError, QueryErrorKind, TableId, UserError, Value,
};
use std::collections::{HashMap, HashSet};

/// A row waiting in the batch buffer.
#[derive(Debug)]
struct Pending {
    row: Row,
    bound: BoundRow,
}

/// What an executor leaves behind.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub errors: Vec<Error>,
    pub failed: HashSet<ObjectId>,
    pub stats: FlushStats,
}

pub struct Executor<'a, C: Connection> {
    cx: &'a Cx,
    conn: &'a C,
    dialect: &'a dyn Dialect,
    mapping: &'a Mapping,
    objects: &'a mut UnitOfWork,
    defer_self_references: bool,
    skip_dependents: bool,
    batch_limit: i32,
    batching: bool,
    statements: HashMap<String, PreparedStatement>,
    buffer: Vec<Pending>,
    buffer_sql: String,
    buffer_owners: HashSet<ObjectId>,
    deferred: Vec<Row>,
    errors: Vec<Error>,
    failed: HashSet<ObjectId>,
    failed_inserts: HashSet<ObjectId>,
    stats: FlushStats,
}

/// Flattened index of the scalar field stored in `(table, column)`.
fn scalar_field(mapping: &Mapping, class: ClassId, table: TableId, column: &str) -> Option<usize> {
    mapping.hierarchy(class).into_iter().find_map(|cid| {
        let c = mapping.class(cid);
        c.fields.iter().position(|f| {
            f.table == table && matches!(&f.kind, FieldKind::Scalar { column: col } if col == column)
        })
        .map(|local| c.field_offset + local)
    })
}

impl<'a, C: Connection> Executor<'a, C> {
    pub fn new(
        cx: &'a Cx,
        conn: &'a C,
        dialect: &'a dyn Dialect,
        mapping: &'a Mapping,
        objects: &'a mut UnitOfWork,
        config: &FlushConfig,
    ) -> Self {
        let batch_limit = config.batch_limit.unwrap_or_else(|| dialect.batch_limit());
        tracing::debug!(batch_limit, "Executor ready");
        Self {
            cx,
            conn,
            dialect,
            mapping,
            objects,
            defer_self_references: config.defer_self_references,
            skip_dependents: config.skip_dependents_of_failed_inserts,
            batch_limit,
            batching: batch_limit != 0,
            statements: HashMap::new(),
            buffer: Vec::new(),
            buffer_sql: String::new(),
            buffer_owners: HashSet::new(),
            deferred: Vec::new(),
            errors: Vec::new(),
            failed: HashSet::new(),
            failed_inserts: HashSet::new(),
            stats: FlushStats::default(),
        }
    }

    /// Carry over failures recorded before execution started.
    pub fn seed_failures(&mut self, errors: Vec<Error>, failed: &HashSet<ObjectId>) {
        self.errors.extend(errors);
        for owner in failed {
            self.fail(*owner);
        }
    }

    pub fn is_batching(&self) -> bool {
        self.batching
    }

    pub fn finish(self) -> ExecutionResult {
        ExecutionResult {
            errors: self.errors,
            failed: self.failed,
            stats: self.stats,
        }
    }

    fn fail(&mut self, owner: ObjectId) {
        self.failed.insert(owner);
        if self
            .objects
            .get(owner)
            .is_some_and(|o| o.state() == ObjectState::New)
        {
            self.failed_inserts.insert(owner);
        }
    }

    fn record(&mut self, row: &Row, error: Error) {
        tracing::debug!(table = row.table().index(), action = %row.action(), error = %error, "Row failed");
        if let Some(owner) = row.failed_object().or(row.owner()) {
            self.fail(owner);
        }
        self.errors.push(error);
    }

    fn succeed(&mut self, row: &Row) {
        match row.action() {
            Action::Insert => self.stats.inserted += 1,
            Action::Update => self.stats.updated += 1,
            Action::Delete => self.stats.deleted += 1,
        }
    }

    /// Rows of failed owners and rows depending on failed inserts are not run.
    fn skip(&mut self, row: &Row) -> bool {
        if let Some(owner) = row.owner() {
            if self.failed.contains(&owner) {
                tracing::debug!(object = %owner, action = %row.action(), "Skipping row of failed object");
                self.stats.skipped += 1;
                return true;
            }
        }
        if !self.skip_dependents {
            return false;
        }
        let upstream = row
            .foreign_keys_set()
            .iter()
            .map(|(_, target)| *target)
            .find(|target| self.failed_inserts.contains(target));
        let Some(upstream) = upstream else {
            return false;
        };
        tracing::warn!(
            object = ?row.owner().map(|o| o.raw()),
            upstream = %upstream,
            table = %self.mapping.table(row.table()),
            "Skipping row that references an object whose insert failed"
        );
        self.stats.skipped += 1;
        if let Some(owner) = row.owner() {
            self.fail(owner);
        }
        true
    }

    /// Resolve identities and foreign keys into column values.
    fn bind(&self, row: &Row) -> Result<BoundRow, Error> {
        let table = self.mapping.table(row.table());
        let mut bound = BoundRow::new(table.name.clone(), row.action());
        let owner = match row.owner() {
            Some(id) => Some(self.objects.get(id).ok_or_else(|| {
                Error::Internal(InternalError {
                    object: Some(id),
                    sql: None,
                    message: "row owner is not tracked".to_string(),
                })
            })?),
            None => None,
        };

        if let (Action::Insert, Some(object)) = (row.action(), owner) {
            for (i, column) in table.primary_key.iter().enumerate() {
                let value = object.key().get(i).cloned().unwrap_or(Value::Null);
                let generated =
                    value.is_null() && table.column(column).is_some_and(|c| c.auto_assign);
                if !generated {
                    bound.set(column, value);
                }
            }
        }
        for (column, value) in row.set_values() {
            bound.set(column, value.clone());
        }
        for (fk_id, target) in row.foreign_keys_set() {
            let fk = self.mapping.foreign_key(*fk_id);
            let referenced = self.objects.get(*target).ok_or_else(|| {
                Error::User(UserError {
                    object: row.owner(),
                    field: None,
                    message: format!("foreign key '{}' references untracked {}", fk.name, target),
                })
            })?;
            for (i, column) in fk.columns.iter().enumerate() {
                bound.set(column, referenced.key().get(i).cloned().unwrap_or(Value::Null));
            }
        }

        if row.uses_key_where() {
            if let Some(object) = owner {
                for (i, column) in table.primary_key.iter().enumerate() {
                    bound.matches(column, object.key().get(i).cloned().unwrap_or(Value::Null));
                }
            }
        }
        for (column, value) in row.where_values() {
            bound.matches(column, value.clone());
        }
        Ok(bound)
    }

    /// Auto-assigned columns of an INSERT that the store must generate.
    fn generated_columns(&self, row: &Row, bound: &BoundRow) -> Vec<String> {
        if row.action() != Action::Insert || row.owner().is_none() {
            return Vec::new();
        }
        self.mapping
            .table(row.table())
            .auto_assign_columns()
            .filter(|c| !bound.set.iter().any(|(name, _)| *name == c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    fn assign_generated(&mut self, row: &Row, columns: &[String], values: Vec<Value>) {
        let mapping = self.mapping;
        let Some(owner) = row.owner() else {
            return;
        };
        let table = mapping.table(row.table());
        let Some(object) = self.objects.get_mut(owner) else {
            return;
        };
        for (column, value) in columns.iter().zip(values) {
            tracing::trace!(object = %owner, column = %column, value = %value, "Generated value");
            if let Some(position) = table.primary_key_position(column) {
                object.set_key_component(position, value);
            } else if let Some(field) = scalar_field(mapping, object.class(), row.table(), column) {
                object.load_value(field, FieldValue::Value(value));
            }
        }
    }

    fn mismatch(&mut self, row: &Row, affected: u64, sql: &str) {
        let table = self.mapping.table(row.table()).name.clone();
        let message = format!("{} affected {} rows, expected 1", row.action(), affected);
        let error = match row.failed_object() {
            Some(object) => Error::OptimisticLock(OptimisticLockError {
                object,
                table,
                message,
            }),
            None => Error::Internal(InternalError {
                object: row.owner(),
                sql: Some(sql.to_string()),
                message: format!("{} on '{}': {}", row.action(), table, message),
            }),
        };
        self.record(row, error);
    }

    fn reconcile_count(&mut self, row: &Row, affected: u64, sql: &str) {
        if affected == 1 || row.kind() == RowKind::AllRows {
            self.succeed(row);
        } else {
            self.mismatch(row, affected, sql);
        }
    }

    fn reconcile_batch(&mut self, row: &Row, count: BatchCount, sql: &str) {
        let detail = match count {
            BatchCount::Affected(n) => return self.reconcile_count(row, n, sql),
            BatchCount::SuccessNoInfo => "reported no row count",
            BatchCount::ExecuteFailed => "failed inside the batch",
        };
        let table = self.mapping.table(row.table()).name.clone();
        let marked = match row.action() {
            Action::Update => row.failed_object().or(row.owner()),
            _ => row.failed_object(),
        };
        let error = match (marked, row.action(), count) {
            (Some(object), _, _) => Error::OptimisticLock(OptimisticLockError {
                object,
                table,
                message: format!("batched {} {}", row.action(), detail),
            }),
            (None, Action::Delete, BatchCount::SuccessNoInfo) => {
                self.succeed(row);
                return;
            }
            (None, Action::Delete, _) => Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: format!("batched DELETE on '{}' {}", table, detail),
                source: None,
            }),
            (None, action, _) => Error::Internal(InternalError {
                object: row.owner(),
                sql: Some(sql.to_string()),
                message: format!("batched {} on '{}' {}", action, table, detail),
            }),
        };
        self.record(row, error);
    }

    /// Prepared statement for `sql`, cached for the rest of the flush.
    async fn statement(&mut self, sql: &str) -> Outcome<PreparedStatement, Error> {
        if let Some(stmt) = self.statements.get(sql) {
            return Outcome::Ok(stmt.clone());
        }
        match self.conn.prepare(self.cx, sql).await {
            Outcome::Ok(stmt) => {
                self.statements.insert(sql.to_string(), stmt.clone());
                Outcome::Ok(stmt)
            }
            Outcome::Err(e) => Outcome::Err(e.with_sql(sql)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run one row, through the batch buffer when possible.
    pub async fn execute(&mut self, row: Row) -> Outcome<(), Error> {
        if !row.is_valid() {
            return Outcome::Ok(());
        }
        // A buffered upstream insert must report its outcome before the skip check.
        let depends_on_buffer = row
            .foreign_keys_set()
            .iter()
            .any(|(_, target)| self.buffer_owners.contains(target));
        if depends_on_buffer {
            match self.drain().await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if self.skip(&row) {
            return Outcome::Ok(());
        }
        let bound = match self.bind(&row) {
            Ok(bound) => bound,
            Err(e) => {
                self.record(&row, e);
                return Outcome::Ok(());
            }
        };
        let sql = self.dialect.render(&bound);

        let batchable = self.batching && row.kind() != RowKind::AllRows;
        if batchable {
            let table = self.mapping.table(row.table());
            if !self.dialect.validate_batch(&bound, table) {
                tracing::debug!(table = %table, "Row refused by batch validation; batching disabled");
                self.batching = false;
            } else {
                if sql != self.buffer_sql {
                    match self.drain().await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                if let Some(owner) = row.owner() {
                    self.buffer_owners.insert(owner);
                }
                self.buffer_sql = sql;
                self.buffer.push(Pending { row, bound });
                return Outcome::Ok(());
            }
        }

        match self.drain().await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.execute_single(row, bound, sql).await
    }

    async fn execute_single(&mut self, row: Row, bound: BoundRow, sql: String) -> Outcome<(), Error> {
        let stmt = match self.statement(&sql).await {
            Outcome::Ok(stmt) => stmt,
            Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
            Outcome::Err(e) => {
                self.record(&row, e);
                return Outcome::Ok(());
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let params = bound.params();
        let generated = self.generated_columns(&row, &bound);
        tracing::trace!(sql = %sql, params = params.len(), generated = generated.len(), "Executing row");
        self.stats.statements += 1;

        if generated.is_empty() {
            match self.conn.execute_prepared(self.cx, &stmt, &params).await {
                Outcome::Ok(affected) => self.reconcile_count(&row, affected, &sql),
                Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
                Outcome::Err(e) => self.record(&row, e.with_sql(&sql)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            match self
                .conn
                .execute_returning(self.cx, &stmt, &params, &generated)
                .await
            {
                Outcome::Ok(result) => {
                    if result.affected == 1 {
                        self.assign_generated(&row, &generated, result.generated);
                    }
                    self.reconcile_count(&row, result.affected, &sql);
                }
                Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
                Outcome::Err(e) => self.record(&row, e.with_sql(&sql)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Execute every buffered row.
    pub async fn drain(&mut self) -> Outcome<(), Error> {
        if self.buffer.is_empty() {
            return Outcome::Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        let sql = std::mem::take(&mut self.buffer_sql);
        self.buffer_owners.clear();

        if pending.len() == 1 || !self.batching {
            for item in pending {
                match self.execute_single(item.row, item.bound, sql.clone()).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            return Outcome::Ok(());
        }

        let stmt = match self.statement(&sql).await {
            Outcome::Ok(stmt) => stmt,
            Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
            Outcome::Err(e) => {
                for p in &pending {
                    if let Some(owner) = p.row.failed_object().or(p.row.owner()) {
                        self.fail(owner);
                    }
                }
                self.errors.push(e);
                return Outcome::Ok(());
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        // Rows sharing one SQL text leave the same columns to the store.
        let generated = self.generated_columns(&pending[0].row, &pending[0].bound);
        let size = if self.batch_limit < 0 {
            pending.len()
        } else {
            (self.batch_limit as usize).max(1)
        };
        for chunk in pending.chunks(size) {
            let params: Vec<Vec<Value>> = chunk.iter().map(|p| p.bound.params()).collect();
            tracing::debug!(sql = %sql, rows = chunk.len(), generated = generated.len(), "Executing batch");
            self.stats.batches += 1;
            self.stats.statements += chunk.len();
            let result = if generated.is_empty() {
                match self.conn.execute_batch(self.cx, &stmt, &params).await {
                    Outcome::Ok(counts) => {
                        Outcome::Ok(counts.into_iter().map(|c| (c, Vec::new())).collect())
                    }
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            } else {
                self.conn
                    .execute_batch_returning(self.cx, &stmt, &params, &generated)
                    .await
            };
            match result {
                Outcome::Ok(results) => {
                    let mut results = results.into_iter();
                    for p in chunk {
                        let (count, values) = results
                            .next()
                            .unwrap_or((BatchCount::ExecuteFailed, Vec::new()));
                        if count == BatchCount::Affected(1) && !values.is_empty() {
                            self.assign_generated(&p.row, &generated, values);
                        }
                        self.reconcile_batch(&p.row, count, &sql);
                    }
                }
                Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
                Outcome::Err(e) => {
                    tracing::debug!(sql = %sql, error = %e, "Batch failed as a whole");
                    for p in chunk {
                        if let Some(owner) = p.row.failed_object().or(p.row.owner()) {
                            self.fail(owner);
                        }
                    }
                    self.errors.push(e.with_sql(&sql));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Evaluate a `LockIntent::Check` with a SELECT before any write.
    pub async fn check_version(&mut self, check: &VersionCheck) -> Outcome<(), Error> {
        let mapping = self.mapping;
        let Some((class, key)) = self
            .objects
            .get(check.owner)
            .map(|o| (o.class(), o.key().to_vec()))
        else {
            return Outcome::Ok(());
        };
        let Some(column) = mapping.class(mapping.root(class)).version_column.as_deref() else {
            return Outcome::Ok(());
        };
        let table = mapping.table(check.table);
        let sql = self.dialect.select_version_sql(table, column);
        let stmt = match self.statement(&sql).await {
            Outcome::Ok(stmt) => stmt,
            Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
            Outcome::Err(e) => {
                self.fail(check.owner);
                self.errors.push(e);
                return Outcome::Ok(());
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        tracing::trace!(sql = %sql, object = %check.owner, "Checking version");
        self.stats.statements += 1;

        match self.conn.query_prepared(self.cx, &stmt, &key).await {
            Outcome::Ok(rows) => {
                let stored = rows.first().and_then(|r| r.first());
                let current = match (stored, check.expected) {
                    (Some(value), Some(expected)) => value.as_i64() == Some(expected),
                    (Some(value), None) => value.is_null(),
                    (None, _) => false,
                };
                if !current {
                    self.fail(check.owner);
                    self.errors.push(Error::OptimisticLock(OptimisticLockError {
                        object: check.owner,
                        table: table.name.clone(),
                        message: format!(
                            "version check failed: expected {:?}, found {}",
                            check.expected,
                            stored.map_or_else(|| "no row".to_string(), ToString::to_string)
                        ),
                    }));
                }
            }
            Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
            Outcome::Err(e) => {
                self.fail(check.owner);
                self.errors.push(e.with_sql(&sql));
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(())
    }

    /// Move foreign keys of an INSERT that cannot be written yet into a
    /// follow-up UPDATE: keys toward rows inserted later, and self references.
    pub fn defer_insert_keys(&mut self, row: &mut Row, id: RowId, order: &FlushOrder, rows: &RowManager) {
        if row.action() != Action::Insert {
            return;
        }
        let (Some(owner), Some(rank)) = (row.owner(), order.rank(id)) else {
            return;
        };
        let mapping = self.mapping;
        let table = mapping.table(row.table());
        let key_assigned = self.objects.get(owner).is_some_and(|o| o.key_assigned());

        let moved: Vec<_> = row
            .foreign_keys_set()
            .iter()
            .copied()
            .filter(|(fk_id, target)| {
                let fk = mapping.foreign_key(*fk_id);
                // Keys sharing primary key columns bind from the identity.
                if fk
                    .columns
                    .iter()
                    .any(|c| table.primary_key_position(c).is_some())
                {
                    return false;
                }
                let Some(dep) = rows.lookup(fk.referenced_table, Action::Insert, *target) else {
                    return false;
                };
                if dep == id {
                    fk.nullable
                        && ((self.defer_self_references && !fk.deferred) || !key_assigned)
                } else {
                    order.rank(dep).is_some_and(|r| r > rank)
                }
            })
            .collect();

        for (fk_id, target) in moved {
            let fk = mapping.foreign_key(fk_id);
            row.clear_foreign_key(fk_id, fk);
            tracing::debug!(
                table = %table,
                foreign_key = %fk.name,
                object = %owner,
                "Deferring foreign key to a follow-up UPDATE"
            );
            let position = match self
                .deferred
                .iter()
                .position(|r| r.table() == row.table() && r.owner() == Some(owner))
            {
                Some(position) => position,
                None => {
                    let mut update =
                        Row::new(row.table(), Action::Update, Some(owner), RowKind::Primary, row.index());
                    update.set_key_where(true);
                    self.deferred.push(update);
                    self.deferred.len() - 1
                }
            };
            self.deferred[position].set_foreign_key(fk_id, fk, Some(target));
        }
    }

    /// Run the follow-up UPDATEs queued by [`Self::defer_insert_keys`].
    pub async fn flush_deferred(&mut self) -> Outcome<(), Error> {
        let deferred = std::mem::take(&mut self.deferred);
        for row in deferred {
            match self.execute(row).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.drain().await
    }

    /// Run a strategy-supplied operation.
    pub async fn execute_custom(&mut self, pending: &PendingCustom) -> Outcome<(), Error> {
        match &pending.operation {
            CustomOperation::UpdateColumns { table, values } => {
                let kind = match self.objects.get(pending.owner) {
                    Some(o) if self.mapping.is_secondary(o.class(), *table) => RowKind::Secondary,
                    _ => RowKind::Primary,
                };
                let mut row = Row::new(*table, Action::Update, Some(pending.owner), kind, usize::MAX);
                row.set_key_where(true);
                for (column, value) in values {
                    row.set_column(column, value.clone());
                }
                self.execute(row).await
            }
            CustomOperation::Statement { sql, params } => {
                if self.failed.contains(&pending.owner) {
                    self.stats.skipped += 1;
                    return Outcome::Ok(());
                }
                match self.drain().await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let stmt = match self.statement(sql).await {
                    Outcome::Ok(stmt) => stmt,
                    Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
                    Outcome::Err(e) => {
                        self.fail(pending.owner);
                        self.errors.push(e);
                        return Outcome::Ok(());
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                tracing::trace!(sql = %sql, "Executing custom statement");
                self.stats.statements += 1;
                match self.conn.execute_prepared(self.cx, &stmt, params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) if e.is_connection_error() => return Outcome::Err(e),
                    Outcome::Err(e) => {
                        self.fail(pending.owner);
                        self.errors.push(e.with_sql(sql));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                Outcome::Ok(())
            }
        }
    }

    /// Close every prepared statement. Close failures are logged only.
    pub async fn release(&mut self) {
        let statements: Vec<PreparedStatement> =
            self.statements.drain().map(|(_, stmt)| stmt).collect();
        let count = statements.len();
        for stmt in statements {
            match self.conn.close_statement(self.cx, stmt).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => tracing::warn!(error = %e, "Failed to close statement"),
                Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                    tracing::warn!("Statement close interrupted");
                }
            }
        }
        tracing::debug!(statements = count, "Released prepared statements");
    }
}
