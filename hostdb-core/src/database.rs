//! Database - Lifecycle Coordinator
//!
//! A [`Database`] lives on the host loop thread. It owns the configuration
//! snapshot, the host filesystem channels and the background thread that
//! opens the engine.
//!
//! # Lifecycle:
//! ```text
//! Uninitialized --init()--> Initializing --> Ready | Failed
//!        any state except Initializing --close()--> Closed
//! ```
//!
//! `init` returns immediately. The init thread opens the engine, loads every
//! registered extension, publishes the engine, moves to `Ready` (or
//! `Failed`), and only then delivers the outcome to the host's `on_ready`
//! callback through a one-shot bridge call. The host loop must be running
//! for that callback to fire.
//!
//! `close` never blocks the host loop: it refuses to run while the engine is
//! still being built, and it only joins the init thread once that thread has
//! finished.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{CallbackChannel, ChannelBuilder, Completion};
use crate::engine::{
    ConfigSnapshot, DatabaseConfig, EngineConnection, Extension, ExtensionRegistry, SqliteEngine,
};
use crate::error::{DbError, QueryError};
use crate::executor::{self, ExecutionMode, QueryExecutionRequest, QueryFuture};
use crate::host::HostLoop;
use crate::vfs::{FileSystem, FileSystemHandlers, HostChannels, NativeFileSystem, VirtualFileSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Closed,
}

type ReadyCallback = Box<dyn FnOnce(Result<(), DbError>)>;
type ReadyChannel = CallbackChannel<Result<(), DbError>, ()>;

/// State the init thread publishes into.
struct Shared {
    state: Mutex<DatabaseState>,
    engine: Mutex<Option<Arc<SqliteEngine>>>,
}

/// Host-side handle to one embedded database.
pub struct Database {
    config: Arc<ConfigSnapshot>,
    shared: Arc<Shared>,
    fs: Arc<dyn FileSystem>,
    channels: HostChannels,
    extensions: ExtensionRegistry,
    ready: ReadyChannel,
    on_ready: Rc<RefCell<Option<ReadyCallback>>>,
    init_thread: RefCell<Option<JoinHandle<()>>>,
}

impl Database {
    /// Create a database bound to `host`.
    ///
    /// With `handlers`, bridged filesystem operations go to the host; without
    /// them the engine uses native I/O.
    pub fn new(host: &HostLoop, config: DatabaseConfig, handlers: Option<FileSystemHandlers>) -> Self {
        let snapshot = config.snapshot();

        let (fs, channels): (Arc<dyn FileSystem>, HostChannels) = match handlers {
            Some(handlers) if !handlers.is_empty() => {
                let channels = handlers.bind(host);
                (Arc::new(VirtualFileSystem::new(channels.clone())), channels)
            }
            _ => (Arc::new(NativeFileSystem::new()), HostChannels::default()),
        };

        let on_ready: Rc<RefCell<Option<ReadyCallback>>> = Rc::new(RefCell::new(None));
        let slot = on_ready.clone();
        let ready = ChannelBuilder::new("database.ready").build(
            host,
            move |outcome: Result<(), DbError>, done: Completion<()>| {
                let callback = slot.borrow_mut().take();
                match callback {
                    Some(callback) => callback(outcome),
                    None => debug!("Readiness signalled without a callback"),
                }
                done.complete(());
            },
        );

        debug!(path = snapshot.path(), bridged = ?channels.configured(), "Database created");
        Self {
            config: snapshot,
            shared: Arc::new(Shared {
                state: Mutex::new(DatabaseState::Uninitialized),
                engine: Mutex::new(None),
            }),
            fs,
            channels,
            extensions: ExtensionRegistry::builtin(),
            ready,
            on_ready,
            init_thread: RefCell::new(None),
        }
    }

    /// Parse `json` and create the database.
    pub fn from_json(
        host: &HostLoop,
        json: &str,
        handlers: Option<FileSystemHandlers>,
    ) -> Result<Self, DbError> {
        Ok(Self::new(host, DatabaseConfig::from_json(json)?, handlers))
    }

    /// Extensions loaded by `init`. Changes after `init` have no effect.
    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    /// Start opening the engine on a background thread.
    ///
    /// `on_ready` runs on the host loop with the outcome. Calling `init` a
    /// second time fails with [`DbError::AlreadyInitialized`] and leaves the
    /// first initialization alone.
    pub fn init<F>(&self, on_ready: F) -> Result<(), DbError>
    where
        F: FnOnce(Result<(), DbError>) + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            match *state {
                DatabaseState::Uninitialized => *state = DatabaseState::Initializing,
                DatabaseState::Closed => return Err(DbError::Closed),
                _ => return Err(DbError::AlreadyInitialized),
            }
        }
        *self.on_ready.borrow_mut() = Some(Box::new(on_ready));

        let shared = self.shared.clone();
        let config = self.config.clone();
        let fs = self.fs.clone();
        let ready = self.ready.clone();
        let extensions: Vec<Arc<dyn Extension>> = self.extensions.iter().cloned().collect();

        let spawned = thread::Builder::new()
            .name("hostdb-init".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    open_engine(config, fs, &extensions)
                }))
                .unwrap_or_else(|_| Err(DbError::Thread("engine initialization panicked".into())));

                let signal = match outcome {
                    Ok(engine) => {
                        *shared.engine.lock() = Some(Arc::new(engine));
                        *shared.state.lock() = DatabaseState::Ready;
                        info!("Database ready");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "Database initialization failed");
                        *shared.state.lock() = DatabaseState::Failed;
                        Err(e)
                    }
                };

                if let Err(e) = ready.invoke(signal) {
                    warn!(error = %e, "Readiness callback did not complete");
                }
                ready.release();
            });

        match spawned {
            Ok(handle) => {
                *self.init_thread.borrow_mut() = Some(handle);
                debug!("Init thread started");
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock() = DatabaseState::Failed;
                self.on_ready.borrow_mut().take();
                Err(DbError::Thread(e.to_string()))
            }
        }
    }

    /// Tear down the engine and release the host channels.
    ///
    /// Fails with [`DbError::InitializationInProgress`] while the engine is
    /// being opened. Otherwise idempotent.
    pub fn close(&self) -> Result<(), DbError> {
        let previous = {
            let mut state = self.shared.state.lock();
            match *state {
                DatabaseState::Initializing => return Err(DbError::InitializationInProgress),
                DatabaseState::Closed => return Ok(()),
                previous => {
                    *state = DatabaseState::Closed;
                    previous
                }
            }
        };

        let engine = self.shared.engine.lock().take();
        drop(engine);
        self.channels.release_all();

        // A running init thread releases the readiness channel itself after
        // delivering the outcome.
        match self.init_thread.borrow_mut().take() {
            None => self.ready.release(),
            Some(handle) if handle.is_finished() => {
                if handle.join().is_err() {
                    warn!("Init thread panicked");
                }
            }
            Some(_) => debug!("Init thread still delivering readiness, detaching"),
        }

        info!(path = self.config.path(), ?previous, "Database closed");
        Ok(())
    }

    pub fn state(&self) -> DatabaseState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == DatabaseState::Closed
    }

    /// The immutable configuration snapshot.
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.clone()
    }

    pub fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    pub fn channels(&self) -> &HostChannels {
        &self.channels
    }

    /// Open a connection to the ready engine.
    pub fn connect(&self) -> Result<Connection, DbError> {
        let engine = match self.state() {
            DatabaseState::Ready => self.shared.engine.lock().clone(),
            DatabaseState::Closed => return Err(DbError::Closed),
            _ => return Err(DbError::NotReady),
        };
        let engine = engine.ok_or(DbError::NotReady)?;
        Ok(Connection::new(Arc::new(engine.connect()?)))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                debug!(error = %e, "Database dropped before initialization finished");
            }
        }
    }
}

fn open_engine(
    config: Arc<ConfigSnapshot>,
    fs: Arc<dyn FileSystem>,
    extensions: &[Arc<dyn Extension>],
) -> Result<SqliteEngine, DbError> {
    let engine = SqliteEngine::open(config, fs)?;
    for extension in extensions {
        engine.load_extension(extension.clone())?;
    }
    Ok(engine)
}

/// A connection that runs each query on its own worker thread.
///
/// Clones share one engine connection and one closed flag.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<dyn EngineConnection>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(inner: Arc<dyn EngineConnection>) -> Self {
        Self {
            inner,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn execute(&self, sql: impl Into<String>, mode: ExecutionMode) -> QueryFuture {
        if self.is_closed() {
            return QueryFuture::rejected(QueryError::ConnectionClosed);
        }
        executor::execute(QueryExecutionRequest::new(self.inner.clone(), sql, mode))
    }

    /// Run `sql` and buffer every row.
    pub fn query(&self, sql: impl Into<String>) -> QueryFuture {
        self.execute(sql, ExecutionMode::Materialized)
    }

    /// Run `sql` and return a cursor.
    pub fn send_query(&self, sql: impl Into<String>) -> QueryFuture {
        self.execute(sql, ExecutionMode::Streaming)
    }

    /// Refuse new queries. Queries already running finish, and results
    /// already handed out stay readable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SharedFs;
    use crate::error::EngineError;
    use std::sync::mpsc;
    use tokio::sync::oneshot;

    /// Holds initialization open until the test lets it go.
    struct Gate(parking_lot::Mutex<Option<mpsc::Receiver<()>>>);

    impl Extension for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn register(&self, _conn: &rusqlite::Connection, _fs: &SharedFs) -> Result<(), EngineError> {
            if let Some(gate) = self.0.lock().take() {
                let _ = gate.recv();
            }
            Ok(())
        }
    }

    fn init_and_wait(host: &HostLoop, db: &Database) -> Result<(), DbError> {
        let (tx, rx) = oneshot::channel();
        db.init(move |outcome| {
            let _ = tx.send(outcome);
        })?;
        host.run_until(async { rx.await.expect("readiness callback dropped") })
    }

    #[test]
    fn test_init_reaches_ready_and_connects() {
        let host = HostLoop::new().unwrap();
        let db = Database::new(&host, DatabaseConfig::in_memory(), None);
        assert_eq!(db.state(), DatabaseState::Uninitialized);
        assert!(matches!(db.connect(), Err(DbError::NotReady)));

        init_and_wait(&host, &db).unwrap();
        assert_eq!(db.state(), DatabaseState::Ready);
        assert!(db.connect().is_ok());
    }

    #[test]
    fn test_second_init_is_rejected() {
        let host = HostLoop::new().unwrap();
        let db = Database::new(&host, DatabaseConfig::in_memory(), None);
        init_and_wait(&host, &db).unwrap();

        let err = db.init(|_| panic!("second callback must not run")).unwrap_err();
        assert!(matches!(err, DbError::AlreadyInitialized));
        assert_eq!(db.state(), DatabaseState::Ready);
    }

    #[test]
    fn test_init_while_initializing_is_rejected() {
        let host = HostLoop::new().unwrap();
        let (open_gate, gate) = mpsc::channel();
        let mut db = Database::new(&host, DatabaseConfig::in_memory(), None);
        db.extensions_mut()
            .register(Arc::new(Gate(parking_lot::Mutex::new(Some(gate)))));

        let (tx, rx) = oneshot::channel();
        db.init(move |outcome| {
            let _ = tx.send(outcome.is_ok());
        })
        .unwrap();
        assert_eq!(db.state(), DatabaseState::Initializing);

        let second_ran = Rc::new(std::cell::Cell::new(false));
        let flag = second_ran.clone();
        let err = db.init(move |_| flag.set(true)).unwrap_err();
        assert!(matches!(err, DbError::AlreadyInitialized));
        assert_eq!(db.state(), DatabaseState::Initializing);

        open_gate.send(()).unwrap();
        assert!(host.run_until(async { rx.await.unwrap() }));
        host.run_until(tokio::task::yield_now());
        assert!(!second_ran.get());
        assert_eq!(db.state(), DatabaseState::Ready);
    }

    #[test]
    fn test_closed_connection_rejects_new_queries() {
        let host = HostLoop::new().unwrap();
        let db = Database::new(&host, DatabaseConfig::in_memory(), None);
        init_and_wait(&host, &db).unwrap();
        let conn = db.connect().unwrap();
        let other = db.connect().unwrap();

        let in_flight = conn.query("SELECT 7");
        let alias = conn.clone();
        conn.close();
        conn.close();
        assert!(alias.is_closed());

        let mut result = host.run_until(in_flight).unwrap();
        assert_eq!(result.fetch_row().unwrap(), Some(vec![crate::engine::Value::Integer(7)]));

        assert_eq!(
            host.run_until(alias.query("SELECT 1")).unwrap_err(),
            QueryError::ConnectionClosed
        );
        assert!(host.run_until(other.query("SELECT 1")).is_ok());
    }

    #[test]
    fn test_close_during_init_is_rejected() {
        let host = HostLoop::new().unwrap();
        let (open_gate, gate) = mpsc::channel();
        let mut db = Database::new(&host, DatabaseConfig::in_memory(), None);
        db.extensions_mut()
            .register(Arc::new(Gate(parking_lot::Mutex::new(Some(gate)))));

        let (tx, rx) = oneshot::channel();
        db.init(move |outcome| {
            let _ = tx.send(outcome.is_ok());
        })
        .unwrap();

        assert_eq!(db.state(), DatabaseState::Initializing);
        assert!(matches!(db.close(), Err(DbError::InitializationInProgress)));

        open_gate.send(()).unwrap();
        assert!(host.run_until(async { rx.await.unwrap() }));
        db.close().unwrap();
        assert!(db.is_closed());
    }

    #[test]
    fn test_failed_open_reports_through_callback() {
        let host = HostLoop::new().unwrap();
        let db = Database::new(
            &host,
            DatabaseConfig::new("/definitely/missing/dir/db.sqlite"),
            None,
        );
        let err = init_and_wait(&host, &db).unwrap_err();
        assert!(matches!(err, DbError::Engine(EngineError::Sqlite(_))));
        assert_eq!(db.state(), DatabaseState::Failed);
        assert!(matches!(db.connect(), Err(DbError::NotReady)));
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let host = HostLoop::new().unwrap();
        let db = Database::new(&host, DatabaseConfig::in_memory(), None);
        db.close().unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.init(|_| {}), Err(DbError::Closed)));
        assert!(matches!(db.connect(), Err(DbError::Closed)));
    }
}
