//! Error types for sqlwrite operations.

use crate::object::ObjectId;
use std::fmt;

/// The primary error type for all sqlwrite operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (unavailable, lost, refused)
    Connection(ConnectionError),
    /// Store-layer statement failures
    Query(QueryError),
    /// Concurrency token mismatch for one object
    OptimisticLock(OptimisticLockError),
    /// Precondition violated by a mapping strategy
    User(UserError),
    /// Logic or driver inconsistency
    Internal(InternalError),
    /// Invalid schema or class mapping
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// No connection could be acquired
    Unavailable,
    /// Connection lost during operation
    Disconnected,
    /// Connection already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// NOT NULL constraint violated
    NotNull,
    /// Foreign key constraint violated
    ForeignKey,
    /// Unique or primary key constraint violated
    UniqueViolation,
    /// Other constraint violation
    Constraint,
    /// Malformed statement
    Syntax,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

/// A row affected a different number of rows than expected and the failure
/// is attributable to a concurrency token mismatch.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub object: ObjectId,
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UserError {
    pub object: Option<ObjectId>,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct InternalError {
    pub object: Option<ObjectId>,
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Table referenced by name does not exist
    UnknownTable,
    /// Column referenced by name does not exist
    UnknownColumn,
    /// Foreign key referenced by name does not exist
    UnknownForeignKey,
    /// Class referenced by name does not exist
    UnknownClass,
    /// Superclass chain loops back on itself
    InheritanceCycle,
    /// Foreign key columns do not line up with the referenced primary key
    KeyArity,
    /// Duplicate definition
    Duplicate,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this an optimistic-lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Is this a fatal internal inconsistency?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// Is this a store-layer statement failure?
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Query(_))
    }

    /// Is this a connection error that requires aborting the flush?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Get SQLSTATE if available (e.g., "23503" for a foreign key violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Internal(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    /// The object this error is attributed to, if any.
    pub fn failed_object(&self) -> Option<ObjectId> {
        match self {
            Error::OptimisticLock(e) => Some(e.object),
            Error::User(e) => e.object,
            Error::Internal(e) => e.object,
            _ => None,
        }
    }

    /// Shorthand for a store error raised by a driver.
    pub fn query(kind: QueryErrorKind, sqlstate: &str, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: None,
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a mapping error.
    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a domain error raised by a strategy.
    pub fn user(object: ObjectId, field: Option<&str>, message: impl Into<String>) -> Self {
        Error::User(UserError {
            object: Some(object),
            field: field.map(str::to_string),
            message: message.into(),
        })
    }

    /// Attach the statement text to a store error that lacks one.
    pub fn with_sql(mut self, text: &str) -> Self {
        if let Error::Query(q) = &mut self {
            if q.sql.is_none() {
                q.sql = Some(text.to_string());
            }
        }
        self
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }

    /// Is this a NOT NULL violation?
    pub fn is_not_null_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23502")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failure for {} in table '{}': {}",
                e.object, e.table, e.message
            ),
            Error::User(e) => match &e.field {
                Some(field) => write!(f, "Invalid value for field '{}': {}", field, e.message),
                None => write!(f, "{}", e.message),
            },
            Error::Internal(e) => write!(f, "Internal error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for sqlwrite operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::ForeignKey,
            sql: Some("DELETE FROM \"teams\" WHERE \"id\" = $1".to_string()),
            sqlstate: Some("23503".to_string()),
            message: "row is still referenced".to_string(),
            source: None,
        };

        assert!(query.is_foreign_key_violation());
        assert!(!query.is_unique_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23503"));
        assert!(err.sql().unwrap().starts_with("DELETE"));
        assert!(err.is_store_error());
    }

    #[test]
    fn classification_flags() {
        let lock = Error::OptimisticLock(OptimisticLockError {
            object: ObjectId::new(4),
            table: "heroes".to_string(),
            message: "version mismatch".to_string(),
        });
        assert!(lock.is_optimistic_lock());
        assert!(!lock.is_fatal());
        assert_eq!(lock.failed_object(), Some(ObjectId::new(4)));

        let fatal = Error::Internal(InternalError {
            object: Some(ObjectId::new(1)),
            sql: None,
            message: "insert affected 0 rows".to_string(),
        });
        assert!(fatal.is_fatal());

        let conn = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Unavailable,
            message: "no connection".to_string(),
            source: None,
        });
        assert!(conn.is_connection_error());
    }

    #[test]
    fn with_sql_keeps_existing_text() {
        let err = Error::query(QueryErrorKind::NotNull, "23502", "null value").with_sql("A");
        let err = err.with_sql("B");
        assert_eq!(err.sql(), Some("A"));
    }

    #[test]
    fn config_error_from_json() {
        let parse = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Config(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
