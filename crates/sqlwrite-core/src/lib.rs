//! Core types and collaborator contracts for sqlwrite.
//!
//! This crate provides the foundational pieces the flush engine consumes:
//!
//! - `Value` for bound parameters and column data
//! - `Error` taxonomy shared by the engine and drivers
//! - `Connection` trait for the opaque store connection
//! - Schema facts (`Table`, `Column`, `ForeignKey`) and the class `Mapping`
//! - `ManagedObject` with per-field dirty bits
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod mapping;
pub mod object;
pub mod schema;
pub mod value;

pub use connection::{BatchCount, Connection, ExecuteResult, PreparedStatement};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, InternalError, MappingError,
    MappingErrorKind, OptimisticLockError, QueryError, QueryErrorKind, Result, UserError,
};
pub use mapping::{
    Action, ClassDef, ClassId, ClassMapping, CustomMode, CustomOperation, FieldContext, FieldDef,
    FieldKind, FieldMapping, FieldStrategy, ForeignKeyDef, Mapping, MappingBuilder, RowSink,
    TableDef,
};
pub use object::{FieldSet, FieldValue, LockIntent, ManagedObject, ObjectId, ObjectState};
pub use schema::{Column, ForeignKey, ForeignKeyId, Table, TableId};
pub use value::Value;
