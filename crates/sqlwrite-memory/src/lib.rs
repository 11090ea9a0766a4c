//! In-memory relational driver for sqlwrite.
//!
//! `MemoryDatabase` builds its tables from a mapping's schema facts and
//! `MemoryConnection` interprets the statements the standard dialects render.
//! Constraints are enforced the way a strict store would: primary keys are
//! unique, NOT NULL columns reject NULL, and immediate foreign keys are checked
//! on every INSERT, UPDATE and DELETE.
//!
//! ```ignore
//! let conn = MemoryDatabase::new(&mapping).connect();
//! conn.fail_next("INSERT INTO \"heroes\"");
//! let report = flusher.flush(&cx, &conn, &mut uow).await;
//! assert_eq!(conn.row_count("heroes"), 0);
//! ```

pub mod connection;
pub mod database;
mod statement;

pub use connection::{ExecutedStatement, MemoryConnection};
pub use database::MemoryDatabase;
