//! SQLite-backed engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row as SqlRow, Statement};
use tracing::{debug, info, warn};

use super::config::{AccessMode, ConfigSnapshot};
use super::extension::{load_into, Extension, SharedFs};
use super::result::{
    Column, MaterializedResult, Row, StreamEvent, StreamTicket, StreamingResult, Value,
};
use super::EngineConnection;
use crate::error::EngineError;
use crate::vfs::FileSystem;

/// Rows buffered between a streaming producer and its consumer.
const STREAM_BUFFER: usize = 64;

/// How often a producer blocked on a full buffer checks for a newer query.
const SUPERSEDE_POLL: Duration = Duration::from_millis(10);

/// Page size assumed when converting the WAL threshold to pages.
const PAGE_SIZE: u64 = 4096;

static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An open database.
///
/// The primary connection lives as long as the engine, which keeps shared
/// in-memory databases alive between connections.
pub struct SqliteEngine {
    config: Arc<ConfigSnapshot>,
    location: String,
    flags: OpenFlags,
    fs: SharedFs,
    primary: Mutex<Connection>,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
}

impl SqliteEngine {
    /// Open the database described by `config`, reading files through `fs`.
    pub fn open(config: Arc<ConfigSnapshot>, fs: Arc<dyn FileSystem>) -> Result<Self, EngineError> {
        let location = if config.is_in_memory() {
            let id = MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("file:hostdb-memory-{}-{id}?mode=memory&cache=shared", std::process::id())
        } else {
            config.path().to_string()
        };
        let flags = match config.access_mode() {
            AccessMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            AccessMode::Automatic | AccessMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
            }
        };

        let primary = open_connection(&location, flags, &config)?;
        info!(
            path = config.path(),
            access_mode = ?config.access_mode(),
            "Database opened"
        );

        Ok(Self {
            config,
            location,
            flags,
            fs: SharedFs::new(fs),
            primary: Mutex::new(primary),
            extensions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    /// Load `extension` now and into every later connection.
    pub fn load_extension(&self, extension: Arc<dyn Extension>) -> Result<(), EngineError> {
        load_into(&self.primary.lock(), extension.as_ref(), &self.fs)?;
        self.extensions.lock().push(extension);
        Ok(())
    }

    pub fn loaded_extensions(&self) -> Vec<String> {
        self.extensions
            .lock()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Open a new connection with every loaded extension applied.
    pub fn connect(&self) -> Result<SqliteConnection, EngineError> {
        let conn = open_connection(&self.location, self.flags, &self.config)?;
        for extension in self.extensions.lock().iter() {
            load_into(&conn, extension.as_ref(), &self.fs)?;
        }
        debug!(path = self.config.path(), "Connection opened");
        Ok(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
            current: Arc::new(AtomicU64::new(0)),
        })
    }
}

fn open_connection(
    location: &str,
    flags: OpenFlags,
    config: &ConfigSnapshot,
) -> Result<Connection, EngineError> {
    let conn = Connection::open_with_flags(location, flags)?;
    apply_options(&conn, config)?;
    Ok(conn)
}

/// Map snapshot options onto pragmas. Options SQLite has no knob for stay in
/// the snapshot for hosts to read.
fn apply_options(conn: &Connection, config: &ConfigSnapshot) -> Result<(), EngineError> {
    let pages = (config.checkpoint_wal_size() / PAGE_SIZE).max(1);
    // Both pragmas echo the new value back as a row.
    conn.query_row(&format!("PRAGMA wal_autocheckpoint = {pages}"), [], |_| Ok(()))?;

    if let Some(limit) = config.maximum_memory() {
        // Process-wide in SQLite.
        conn.query_row(&format!("PRAGMA hard_heap_limit = {limit}"), [], |_| Ok(()))?;
    }
    if !config.use_temporary_directory() {
        conn.execute_batch("PRAGMA temp_store = MEMORY")?;
    }
    if config.use_direct_io() {
        debug!("Direct I/O requested; SQLite uses buffered I/O");
    }
    Ok(())
}

/// One engine connection. Statements on it run one at a time.
///
/// An open stream holds the connection until it is drained, closed, or
/// superseded by the next query started here.
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    current: Arc<AtomicU64>,
}

impl EngineConnection for SqliteConnection {
    fn query(&self, sql: &str) -> Result<MaterializedResult, EngineError> {
        StreamTicket::issue(&self.current);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns = describe(&stmt);
        let width = stmt.column_count();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            rows.push(read_row(row, width)?);
        }
        debug!(rows = rows.len(), "Materialized query finished");
        Ok(MaterializedResult::new(columns, rows))
    }

    fn send_query(&self, sql: &str) -> Result<StreamingResult, EngineError> {
        let (header_tx, header_rx) = bounded::<Result<Vec<Column>, EngineError>>(1);
        let (row_tx, row_rx) = bounded(STREAM_BUFFER);
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let ticket = StreamTicket::issue(&self.current);
        let producer = ticket.clone();

        thread::Builder::new()
            .name("hostdb-stream".to_string())
            .spawn(move || {
                let conn = conn.lock();
                if producer.is_stale() {
                    let _ = header_tx.send(Err(EngineError::StreamSuperseded));
                    return;
                }
                let mut stmt = match conn.prepare(&sql) {
                    Ok(stmt) => stmt,
                    Err(e) => {
                        let _ = header_tx.send(Err(e.into()));
                        return;
                    }
                };
                let width = stmt.column_count();
                let columns = describe(&stmt);
                let mut cursor = match stmt.query([]) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        let _ = header_tx.send(Err(e.into()));
                        return;
                    }
                };
                if header_tx.send(Ok(columns)).is_err() {
                    return;
                }

                let mut produced = 0usize;
                loop {
                    if producer.is_stale() {
                        debug!(produced, "Stream superseded, releasing connection");
                        return;
                    }
                    let event = match cursor.next() {
                        Ok(Some(row)) => match read_row(row, width) {
                            Ok(values) => StreamEvent::Row(values),
                            Err(e) => StreamEvent::Failed(e),
                        },
                        Ok(None) => break,
                        Err(e) => StreamEvent::Failed(e.into()),
                    };
                    let failed = matches!(event, StreamEvent::Failed(_));
                    if !deliver(&row_tx, event, &producer) {
                        debug!(produced, "Stream consumer gone, releasing connection");
                        return;
                    }
                    if failed {
                        return;
                    }
                    produced += 1;
                }
                debug!(produced, "Streaming query finished");
            })
            .map_err(|e| {
                warn!(error = %e, "Failed to spawn stream producer");
                EngineError::StreamClosed
            })?;

        let columns = header_rx.recv().map_err(|_| EngineError::StreamClosed)??;
        Ok(StreamingResult::new(columns, row_rx).with_ticket(ticket))
    }
}

/// Hand `event` to the consumer. Returns `false` once the consumer hung up
/// or a newer query took over the connection.
fn deliver(tx: &Sender<StreamEvent>, mut event: StreamEvent, ticket: &StreamTicket) -> bool {
    loop {
        match tx.send_timeout(event, SUPERSEDE_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Disconnected(_)) => return false,
            Err(SendTimeoutError::Timeout(back)) => {
                if ticket.is_stale() {
                    return false;
                }
                event = back;
            }
        }
    }
}

fn describe(stmt: &Statement<'_>) -> Vec<Column> {
    stmt.columns()
        .into_iter()
        .map(|c| Column {
            name: c.name().to_string(),
            decl_type: c.decl_type().map(str::to_string),
        })
        .collect()
}

fn read_row(row: &SqlRow<'_>, width: usize) -> Result<Row, EngineError> {
    (0..width)
        .map(|i| -> Result<Value, EngineError> { Ok(Value::from(row.get_ref(i)?)) })
        .collect()
}
