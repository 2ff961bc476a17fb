//! Error taxonomy shared across the bridge, the filesystem adapter, the engine
//! and the lifecycle coordinator.
//!
//! Each layer owns one `thiserror` enum and wraps the layer below it, so a
//! failure raised inside a host handler can surface all the way up to a
//! rejected query future with its message intact.

use thiserror::Error;

/// Failures of a single synchronous bridge call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The channel was released before (or while) the call was enqueued.
    #[error("callback channel '{0}' is closed")]
    ChannelClosed(String),

    /// The host handler reported a failure through its completion.
    #[error("host handler failed: {0}")]
    Handler(String),

    /// The host handler dropped its completion without signalling it.
    #[error("host handler on channel '{0}' dropped its completion")]
    Abandoned(String),

    /// The host handler panicked while running on the host loop.
    #[error("host handler on channel '{channel}' panicked: {message}")]
    Panicked { channel: String, message: String },

    /// The configured call timeout elapsed before the handler completed.
    #[error("bridge call on channel '{0}' timed out")]
    Timeout(String),
}

/// Failures of the virtual filesystem adapter.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A host-opened handle was used with an operation that has no host
    /// handler configured.
    #[error("operation '{operation}' is not supported for host handle {id}")]
    Unsupported { operation: &'static str, id: u64 },

    #[error("invalid file handle: {0}")]
    InvalidHandle(String),
}

/// Failures reported by the embedded engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Filesystem(#[from] FsError),

    #[error("extension '{name}' failed to load: {reason}")]
    Extension { name: String, reason: String },

    #[error("result stream ended unexpectedly")]
    StreamClosed,

    /// A newer query on the same connection took over from this stream.
    #[error(
        "No data has been returned (possibly stream has been closed: only one stream can be \
         active on one connection at a time)"
    )]
    StreamSuperseded,

    #[error("Result closed")]
    ResultClosed,
}

/// Rejection reasons of an async query future.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The engine reported an explicit failure.
    #[error("{0}")]
    Execution(String),

    /// Catch-all for unclassified failures on the worker thread.
    #[error("{0}")]
    Unknown(String),

    /// The worker vanished without settling the future.
    #[error("query worker exited without a result")]
    Dropped,

    /// The query was submitted on a closed connection.
    #[error("connection is closed")]
    ConnectionClosed,
}

/// Errors raised by the lifecycle coordinator.
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed configuration shape.
    #[error("invalid configuration: {0}")]
    Construction(String),

    #[error("database is already initialized")]
    AlreadyInitialized,

    #[error("database initialization is still in progress")]
    InitializationInProgress,

    #[error("database is not ready")]
    NotReady,

    #[error("database is closed")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The background initialization thread could not run to completion.
    #[error("initialization thread failed: {0}")]
    Thread(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Construction(err.to_string())
    }
}

pub type Result<T, E = DbError> = std::result::Result<T, E>;
