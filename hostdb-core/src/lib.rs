//! hostdb Core - An Embedded SQL Engine Bridged Onto A Single-Threaded Host Loop
//!
//! Host-side code (filesystem handlers, readiness callbacks, query awaiting)
//! runs on one cooperative [`HostLoop`]. Engine work runs on background
//! threads that reach back into the host through synchronous bridge calls.
//!
//! # Pieces:
//! - [`bridge`]: callback channels and blocking bridge calls
//! - [`vfs`]: the engine's filesystem, routed to host handlers when present
//! - [`engine`]: SQLite-backed engine, configuration, results, extensions
//! - [`executor`]: one worker thread per query, settled through a future
//! - [`Database`]: background initialization and ordered teardown
//!
//! ```no_run
//! use hostdb_core::{Database, DatabaseConfig, HostLoop};
//!
//! let host = HostLoop::new()?;
//! let db = Database::new(&host, DatabaseConfig::in_memory(), None);
//! let (tx, rx) = tokio::sync::oneshot::channel();
//! db.init(move |outcome| {
//!     let _ = tx.send(outcome);
//! })?;
//! host.run_until(async { rx.await })??;
//!
//! let conn = db.connect()?;
//! let mut result = host.run_until(conn.query("SELECT 1"))?;
//! assert_eq!(result.fetch_all_rows()?.len(), 1);
//! db.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bridge;
pub mod database;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host;
pub mod vfs;

pub use bridge::{CallbackChannel, ChannelBuilder, ChannelOptions, Completion};
pub use database::{Connection, Database, DatabaseState};
pub use engine::{
    Column, ConfigSnapshot, DatabaseConfig, DatabaseOptions, Extension, ExtensionRegistry,
    QueryResult, ResultType, Value,
};
pub use error::{BridgeError, DbError, EngineError, FsError, QueryError};
pub use executor::{ExecutionMode, QueryFuture, QueryState};
pub use host::HostLoop;
pub use vfs::{FileSystem, FileSystemHandlers, HostFileSystem, StdHostFileSystem};

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(!init_logging());
    }
}
