//! sqlwrite - transactional write ordering and batched flush for
//! object-relational persistence.
//!
//! sqlwrite takes the pending changes of a unit of work (new, modified and
//! deleted objects) and writes them through one connection so that every
//! statement satisfies the store's immediate foreign key constraints:
//!
//! - Rows are deduplicated per `(table, action, owner)` and collected
//!   through per-field mapping strategies
//! - Inserts, updates and deletes are ordered by a depth-first walk of the
//!   foreign key graph; cycles break through nullable keys
//! - Consecutive compatible rows are batched and results reconciled per row
//! - Optimistic-lock and store failures are collected, never thrown
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlwrite::prelude::*;
//! use std::sync::Arc;
//!
//! let mapping = MappingBuilder::new()
//!     .table(TableDef::new("teams")
//!         .column(Column::new("id").auto_assign())
//!         .column(Column::new("name"))
//!         .primary_key(&["id"]))
//!     .table(TableDef::new("heroes")
//!         .column(Column::new("id").auto_assign())
//!         .column(Column::new("name"))
//!         .column(Column::new("team_id").not_null())
//!         .primary_key(&["id"])
//!         .foreign_key(ForeignKeyDef::new("fk_hero_team", &["team_id"], "teams")))
//!     .class(ClassDef::new("Team", "teams").field(FieldDef::scalar("name", "name")))
//!     .class(ClassDef::new("Hero", "heroes")
//!         .field(FieldDef::scalar("name", "name"))
//!         .field(FieldDef::relation("team", "fk_hero_team", "Team")))
//!     .build()?;
//!
//! let mut uow = UnitOfWork::new();
//! let team = uow.track_new(team_class, vec![Value::Null], vec![Value::from("Avengers").into()]);
//! uow.track_new(hero_class, vec![Value::Null], vec![
//!     Value::from("Thor").into(),
//!     FieldValue::Ref(Some(team)),
//! ]);
//!
//! let flusher = Flusher::new(Arc::new(mapping), StandardDialect::postgres());
//! let report = flusher.flush(&cx, &conn, &mut uow).await?;
//! assert!(report.is_success());
//! ```

pub use sqlwrite_core::{
    Action, BatchCount, ClassDef, ClassId, ClassMapping, Column, ConfigError, Connection,
    ConnectionError, ConnectionErrorKind, CustomMode, CustomOperation, Cx, Error, ExecuteResult,
    FieldContext, FieldDef, FieldKind, FieldMapping, FieldSet, FieldStrategy, FieldValue,
    ForeignKey, ForeignKeyDef, ForeignKeyId, InternalError, LockIntent, ManagedObject, Mapping,
    MappingBuilder, MappingError, MappingErrorKind, ObjectId, ObjectState, OptimisticLockError,
    Outcome, PreparedStatement, QueryError, QueryErrorKind, Result, RowSink, Table, TableDef,
    TableId, UserError, Value,
};

pub use sqlwrite_flush::{
    BoundRow, Dialect, DialectKind, FlushConfig, FlushOrder, FlushReport, FlushStats, Flusher,
    PendingCounts, Row, RowId, RowKind, RowManager, StandardDialect, UnitOfWork, UowError,
};

pub use sqlwrite_memory::{ExecutedStatement, MemoryConnection, MemoryDatabase};

/// Everything needed to describe a mapping and flush a unit of work.
pub mod prelude {
    pub use crate::{
        Action, ClassDef, ClassId, Column, Connection, Cx, Dialect, DialectKind, Error,
        FieldDef, FieldValue, FlushConfig, FlushReport, FlushStats, Flusher, ForeignKeyDef,
        LockIntent, Mapping, MappingBuilder, ObjectId, ObjectState, Outcome, Result,
        StandardDialect, TableDef, UnitOfWork, Value,
    };
}
