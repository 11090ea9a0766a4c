//! Dependency-ordered, batched flush engine for sqlwrite.
//!
//! The flush pipeline:
//!
//! - `collector` turns managed objects into rows
//! - `row_manager` deduplicates rows per `(table, action, owner)`
//! - `orderer` sorts rows so foreign keys are satisfied at every statement
//! - `executor` binds, batches and reconciles statements against a `Connection`
//! - `flush` ties it together behind [`Flusher`]

pub mod collector;
pub mod dialect;
pub mod executor;
pub mod flush;
pub mod orderer;
pub mod row;
pub mod row_manager;
pub mod unit_of_work;

pub use collector::{Collection, Collector};
pub use dialect::{BoundRow, Dialect, DialectKind, StandardDialect};
pub use executor::{ExecutionResult, Executor};
pub use flush::{FlushConfig, FlushReport, FlushStats, Flusher};
pub use orderer::{FlushOrder, order};
pub use row::{Row, RowId, RowKind, VersionCheck};
pub use row_manager::{PendingCustom, RowManager};
pub use unit_of_work::{PendingCounts, UnitOfWork, UowError};
