//! Flush entry point.
//!
//! A [`Flusher`] writes every pending change of a [`UnitOfWork`] through one
//! connection, in dependency order:
//!
//! 1. Version checks for objects locked without changes
//! 2. All-row updates and deletes
//! 3. Secondary-table deletes
//! 4. Corrective updates that release references to deleted rows
//! 5. Primary rows: inserts, updates, deletes
//! 6. Secondary-table inserts and updates
//! 7. Follow-up updates for deferred insert keys
//! 8. Custom operations
//!
//! The caller owns the transaction: a flush never commits or rolls back.
//!
//! # Example
//!
//! ```ignore
//! let flusher = Flusher::new(Arc::new(mapping), StandardDialect::postgres());
//! let report = flusher.flush(&cx, &conn, &mut uow).await?;
//! if report.is_success() {
//!     conn.commit(&cx).await?;
//! }
//! ```

use crate::collector::{Collection, Collector};
use crate::dialect::Dialect;
use crate::executor::{ExecutionResult, Executor};
use crate::orderer::{self, FlushOrder};
use crate::row_manager::RowManager;
use crate::unit_of_work::UnitOfWork;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use sqlwrite_core::{
    ConfigError, Connection, Error, LockIntent, ManagedObject, Mapping, ObjectId, ObjectState,
    Result,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Flush behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Overrides the dialect's batch limit: -1 unlimited, 0 disabled.
    pub batch_limit: Option<i32>,
    pub defer_self_references: bool,
    pub skip_dependents_of_failed_inserts: bool,
    /// Leave auto-commit mode before the first statement.
    pub disable_auto_commit: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_limit: None,
            defer_self_references: true,
            skip_dependents_of_failed_inserts: true,
            disable_auto_commit: true,
        }
    }
}

impl FlushConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_limit(mut self, limit: i32) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    pub fn defer_self_references(mut self, enabled: bool) -> Self {
        self.defer_self_references = enabled;
        self
    }

    pub fn skip_dependents_of_failed_inserts(mut self, enabled: bool) -> Self {
        self.skip_dependents_of_failed_inserts = enabled;
        self
    }

    pub fn disable_auto_commit(mut self, enabled: bool) -> Self {
        self.disable_auto_commit = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.batch_limit {
            Some(limit) if limit < -1 => Err(Error::Config(ConfigError {
                message: format!("batch_limit must be -1, 0 or positive, got {}", limit),
                source: None,
            })),
            _ => Ok(()),
        }
    }

    /// Parse and validate a JSON configuration; missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Counters of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Batched executions
    pub batches: usize,
    /// Row executions, batched or not
    pub statements: usize,
    /// Rows placed by the cycle bail-out
    pub unresolved: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

/// Result of a flush that ran to completion.
///
/// An empty `errors` list means every row was written; otherwise the caller
/// is expected to roll back.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub errors: Vec<Error>,
    pub stats: FlushStats,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_optimistic_lock_failures(&self) -> bool {
        self.errors.iter().any(Error::is_optimistic_lock)
    }

    /// Objects named by the collected errors, in error order.
    pub fn failed_objects(&self) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        self.errors
            .iter()
            .filter_map(Error::failed_object)
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Whether a flush has anything to write for `object`.
fn has_pending_work(object: &ManagedObject) -> bool {
    match object.state() {
        ObjectState::New | ObjectState::Deleted => true,
        ObjectState::Removed => false,
        ObjectState::Persistent | ObjectState::Dirty => {
            !object.unflushed_dirty_fields().is_empty()
                || object.indicators_dirty()
                || object.lock() != LockIntent::None
        }
    }
}

/// Writes units of work through a dialect.
pub struct Flusher {
    mapping: Arc<Mapping>,
    dialect: Arc<dyn Dialect>,
    config: FlushConfig,
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("dialect", &self.dialect.kind())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Flusher {
    pub fn new(mapping: Arc<Mapping>, dialect: impl Dialect + 'static) -> Self {
        Self {
            mapping,
            dialect: Arc::new(dialect),
            config: FlushConfig::default(),
        }
    }

    /// Replace the configuration after validating it.
    pub fn with_config(mut self, config: FlushConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Write every pending change of `uow`.
    ///
    /// Per-row failures are collected in the report. Only connection errors,
    /// cancellation and panics end the flush early; prepared statements are
    /// released either way.
    #[tracing::instrument(level = "info", skip(self, cx, conn, uow), fields(objects = uow.len()))]
    pub async fn flush<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        uow: &mut UnitOfWork,
    ) -> Outcome<FlushReport, Error> {
        let start = Instant::now();

        let touched: Vec<ObjectId> = uow
            .objects()
            .filter(|o| has_pending_work(o))
            .map(ManagedObject::id)
            .collect();
        if touched.is_empty() {
            tracing::debug!("Nothing to flush");
            return Outcome::Ok(FlushReport::default());
        }

        if self.config.disable_auto_commit && conn.auto_commit() {
            tracing::debug!("Disabling auto-commit for flush");
            match conn.set_auto_commit(cx, false).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let Collection {
            rows,
            errors,
            failed,
            versions,
        } = Collector::new(&self.mapping).collect(uow.objects());
        let order = orderer::order(&self.mapping, &rows);
        tracing::debug!(
            rows = order.rows.len(),
            corrective = order.delete_updates.len(),
            unresolved = order.unresolved,
            "Flush order computed"
        );

        let mut executor =
            Executor::new(cx, conn, &*self.dialect, &self.mapping, uow, &self.config);
        executor.seed_failures(errors, &failed);
        let outcome = Self::run(&mut executor, &rows, &order).await;
        executor.release().await;
        let ExecutionResult {
            errors,
            failed,
            mut stats,
        } = executor.finish();

        match outcome {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Flush aborted");
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        for id in touched.iter().filter(|id| !failed.contains(id)) {
            if let Some(object) = uow.get_mut(*id) {
                if let Some(version) = versions.get(id) {
                    object.set_version(Some(*version));
                }
                object.mark_flushed();
            }
        }

        stats.unresolved = order.unresolved;
        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            batches = stats.batches,
            statements = stats.statements,
            skipped = stats.skipped,
            errors = errors.len(),
            elapsed_ms = stats.elapsed_ms,
            "Flush complete"
        );
        Outcome::Ok(FlushReport { errors, stats })
    }

    async fn run<C: Connection>(
        executor: &mut Executor<'_, C>,
        rows: &RowManager,
        order: &FlushOrder,
    ) -> Outcome<(), Error> {
        for check in rows.version_checks() {
            match executor.check_version(check).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let early = rows
            .all_row_updates()
            .iter()
            .chain(rows.all_row_deletes())
            .chain(rows.secondary_deletes())
            .map(|id| rows.row(*id).clone());
        for row in early.chain(order.delete_updates.iter().cloned()) {
            match executor.execute(row).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for id in &order.rows {
            let mut row = rows.row(*id).clone();
            executor.defer_insert_keys(&mut row, *id, order, rows);
            match executor.execute(row).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for id in rows.secondary_updates() {
            match executor.execute(rows.row(*id).clone()).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match executor.flush_deferred().await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        for pending in rows.custom_operations() {
            match executor.execute_custom(pending).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        executor.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FlushConfig::default();
        assert_eq!(config.batch_limit, None);
        assert!(config.defer_self_references);
        assert!(config.skip_dependents_of_failed_inserts);
        assert!(config.disable_auto_commit);
    }

    #[test]
    fn test_config_from_json_partial() {
        let config = FlushConfig::from_json(r#"{"batch_limit": 25, "disable_auto_commit": false}"#)
            .unwrap();
        assert_eq!(config.batch_limit, Some(25));
        assert!(!config.disable_auto_commit);
        assert!(config.defer_self_references);
    }

    #[test]
    fn test_config_rejects_invalid_batch_limit() {
        let err = FlushConfig::from_json(r#"{"batch_limit": -2}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(FlushConfig::new().batch_limit(-2).validate().is_err());
        assert!(FlushConfig::new().batch_limit(-1).validate().is_ok());
    }

    #[test]
    fn test_config_rejects_malformed_json() {
        assert!(matches!(
            FlushConfig::from_json("{not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stats_serialize() {
        let stats = FlushStats {
            inserted: 2,
            batches: 1,
            ..FlushStats::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["batches"], 1);
        assert_eq!(json["elapsed_ms"], 0);
    }

    #[test]
    fn test_report_failed_objects_dedup() {
        use sqlwrite_core::OptimisticLockError;
        let lock = |raw| {
            Error::OptimisticLock(OptimisticLockError {
                object: ObjectId::new(raw),
                table: "heroes".to_string(),
                message: "stale".to_string(),
            })
        };
        let report = FlushReport {
            errors: vec![lock(2), lock(1), lock(2), Error::Custom("x".into())],
            stats: FlushStats::default(),
        };
        assert!(!report.is_success());
        assert!(report.has_optimistic_lock_failures());
        assert_eq!(
            report.failed_objects(),
            vec![ObjectId::new(2), ObjectId::new(1)]
        );
    }
}
