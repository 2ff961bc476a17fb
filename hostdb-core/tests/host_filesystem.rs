//! Queries that read files through host filesystem handlers.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use hostdb_core::vfs::{FileId, ReadChunk};
use hostdb_core::{
    Database, DatabaseConfig, ExecutionMode, FileSystemHandlers, HostLoop, QueryError,
    StdHostFileSystem, Value,
};
use tokio::sync::oneshot;

fn init(host: &HostLoop, db: &Database) {
    let (tx, rx) = oneshot::channel();
    db.init(move |outcome| {
        let _ = tx.send(outcome);
    })
    .unwrap();
    host.run_until(async { rx.await.unwrap() }).unwrap();
}

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::File::create(&path)
        .unwrap()
        .write_all(contents)
        .unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_engine_reads_through_std_host_filesystem() {
    let host = HostLoop::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "notes.txt", b"bridged contents");

    let db = Database::new(
        &host,
        DatabaseConfig::in_memory(),
        Some(FileSystemHandlers::from_host(StdHostFileSystem::new())),
    );
    assert_eq!(db.channels().configured().len(), 6);
    init(&host, &db);

    let conn = db.connect().unwrap();
    let mut result = host
        .run_until(conn.query(format!("SELECT read_text('{path}'), file_size('{path}')")))
        .unwrap();
    assert_eq!(
        result.fetch_all_rows().unwrap(),
        vec![vec![
            Value::Text("bridged contents".to_string()),
            Value::Integer(16)
        ]]
    );

    db.close().unwrap();
    assert!(db.channels().all_released());
}

#[test]
fn test_handlers_run_on_host_thread_in_call_order() {
    let host = HostLoop::new().unwrap();
    let host_thread = std::thread::current().id();
    let calls = Rc::new(RefCell::new(Vec::new()));

    let log = calls.clone();
    let open_log = calls.clone();
    let size_log = calls.clone();
    let handlers = FileSystemHandlers::new()
        .open_file(move |req, done| {
            assert_eq!(std::thread::current().id(), host_thread);
            open_log.borrow_mut().push(format!("open {}", req.path));
            done.complete(FileId(7));
        })
        .get_file_size(move |path, done| {
            size_log.borrow_mut().push(format!("size {path}"));
            done.complete(5);
        })
        .read(move |req, done| {
            log.borrow_mut().push(format!("read {} {}", req.fd, req.length));
            // One chunk, then end of file.
            let data = if log.borrow().iter().filter(|c| c.starts_with("read")).count() == 1 {
                b"hello".to_vec()
            } else {
                Vec::new()
            };
            done.complete(ReadChunk::new(data));
        });

    let db = Database::new(&host, DatabaseConfig::in_memory(), Some(handlers));
    init(&host, &db);

    let conn = db.connect().unwrap();
    let mut result = host
        .run_until(conn.query("SELECT read_text('virtual://greeting')"))
        .unwrap();
    assert_eq!(
        result.fetch_row().unwrap(),
        Some(vec![Value::Text("hello".to_string())])
    );

    let calls = calls.borrow();
    assert_eq!(calls[0], "open virtual://greeting");
    assert_eq!(calls[1], "size virtual://greeting");
    assert!(calls[2].starts_with("read 7 "));
    assert_eq!(calls.len(), 4);
}

#[test]
fn test_empty_host_glob_counts_zero() {
    let host = HostLoop::new().unwrap();
    let handlers = FileSystemHandlers::new().glob(|_, done| done.complete(Vec::new()));
    let db = Database::new(&host, DatabaseConfig::in_memory(), Some(handlers));
    init(&host, &db);

    let conn = db.connect().unwrap();
    let mut result = host
        .run_until(conn.query("SELECT glob_count('remote://bucket/*.csv')"))
        .unwrap();
    assert_eq!(result.fetch_row().unwrap(), Some(vec![Value::Integer(0)]));
}

#[test]
fn test_host_failure_rejects_query() {
    let host = HostLoop::new().unwrap();
    let handlers =
        FileSystemHandlers::new().open_file(|req, done| done.fail(format!("access denied: {}", req.path)));
    let db = Database::new(&host, DatabaseConfig::in_memory(), Some(handlers));
    init(&host, &db);

    let conn = db.connect().unwrap();
    match host.run_until(conn.query("SELECT read_blob('secret.bin')")) {
        Err(QueryError::Execution(msg)) => assert!(msg.contains("access denied: secret.bin")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_streaming_rows_read_through_host_off_loop() {
    let host = HostLoop::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(&dir, "a.txt", b"alpha");
    let b = write_file(&dir, "b.txt", b"beta");

    let db = Database::new(
        &host,
        DatabaseConfig::in_memory(),
        Some(FileSystemHandlers::from_host(StdHostFileSystem::new())),
    );
    init(&host, &db);

    let conn = db.connect().unwrap();
    let sql = format!(
        "SELECT read_text(p) FROM (SELECT '{a}' AS p UNION ALL SELECT '{b}') ORDER BY 1"
    );
    let mut result = host
        .run_until(conn.execute(sql, ExecutionMode::Streaming))
        .unwrap();

    // Each row calls back into the host, so drain on another thread while the
    // host loop runs.
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(result.fetch_all_rows().map_err(|e| e.to_string()));
    });
    let rows = host.run_until(async { rx.await.unwrap() }).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Text("alpha".to_string())],
            vec![Value::Text("beta".to_string())]
        ]
    );
}

#[test]
fn test_bridge_fails_fast_after_close() {
    let host = HostLoop::new().unwrap();
    let db = Database::new(
        &host,
        DatabaseConfig::in_memory(),
        Some(FileSystemHandlers::new().glob(|_, done| done.complete(vec!["x".to_string()]))),
    );
    init(&host, &db);
    let conn = db.connect().unwrap();
    db.close().unwrap();

    // The connection outlives the database; its file functions now hit a
    // released channel.
    match host.run_until(conn.query("SELECT glob_count('*')")) {
        Err(QueryError::Execution(msg)) => assert!(msg.contains("closed")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
