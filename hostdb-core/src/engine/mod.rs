//! Engine - The Embedded SQL Engine Behind The Bridge
//!
//! The engine is consumed through a narrow surface: open a database from a
//! [`ConfigSnapshot`] and a [`FileSystem`](crate::vfs::FileSystem), load
//! [`Extension`]s, open connections, and run a query either materialized or
//! streamed. [`EngineConnection`] is the seam the query executor runs
//! against; [`SqliteEngine`] is the shipped implementation.

pub mod config;
pub mod extension;
pub mod result;
mod sqlite;

pub use config::{AccessMode, ConfigSnapshot, DatabaseConfig, DatabaseOptions, NullOrder, OrderType};
pub use extension::{Extension, ExtensionRegistry, FileFunctions, SharedFs};
pub use result::{Column, MaterializedResult, QueryResult, ResultType, Row, StreamingResult, Value};
pub use sqlite::{SqliteConnection, SqliteEngine};

use crate::error::EngineError;

/// A connection the executor can run queries on from any thread.
pub trait EngineConnection: Send + Sync {
    /// Run `sql` to completion and buffer every row.
    fn query(&self, sql: &str) -> Result<MaterializedResult, EngineError>;

    /// Start `sql` and return a cursor as soon as the first step succeeds.
    fn send_query(&self, sql: &str) -> Result<StreamingResult, EngineError>;
}
