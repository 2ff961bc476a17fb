//! hostdb - Run SQL Against An Embedded Database From The Command Line
//!
//! Opens a database on a host loop, waits for initialization, runs one query
//! in the chosen mode and prints each row as a JSON array on its own line.

use anyhow::{anyhow, bail, Context, Result};
use hostdb_core::{
    init_logging, Database, DatabaseConfig, ExecutionMode, FileSystemHandlers, HostLoop,
    QueryResult, StdHostFileSystem,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

fn print_help() {
    println!("hostdb - embedded SQL over a host loop v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  hostdb [OPTIONS] <SQL>");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help             Print this help message");
    println!("  -v, --version          Print version information");
    println!("      --config <FILE>    Read database configuration from a JSON file");
    println!("      --db <PATH>        Database file (default: in-memory)");
    println!("      --mode <MODE>      materialized (default) or streaming");
    println!("      --host-fs          Route file functions through host handlers");
    println!();
    println!("EXAMPLES:");
    println!("  hostdb \"SELECT 1\"");
    println!("  hostdb --host-fs \"SELECT read_text('notes.txt')\"");
    println!();
    println!("Set RUST_LOG=debug to trace bridge calls.");
}

struct Args {
    config: Option<String>,
    db: Option<String>,
    mode: ExecutionMode,
    host_fs: bool,
    sql: String,
}

/// Parse arguments. `Ok(None)` means help or version was printed.
fn parse_args(args: &[String]) -> Result<Option<Args>> {
    let mut config = None;
    let mut db = None;
    let mut mode = ExecutionMode::Materialized;
    let mut host_fs = false;
    let mut sql = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("hostdb {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--config" => {
                config = Some(iter.next().context("--config needs a file")?.clone());
            }
            "--db" => {
                db = Some(iter.next().context("--db needs a path")?.clone());
            }
            "--mode" => {
                let value = iter.next().context("--mode needs a value")?;
                mode = value.parse().map_err(|e: String| anyhow!(e))?;
            }
            "--host-fs" => host_fs = true,
            other if other.starts_with('-') => {
                bail!("unrecognized argument '{other}'\nRun 'hostdb --help' for usage information.");
            }
            other => {
                if sql.replace(other.to_string()).is_some() {
                    bail!("expected a single SQL argument");
                }
            }
        }
    }

    let sql = sql.context("missing SQL argument\nRun 'hostdb --help' for usage information.")?;
    Ok(Some(Args {
        config,
        db,
        mode,
        host_fs,
        sql,
    }))
}

fn print_rows(mut result: QueryResult) -> Result<usize> {
    let mut printed = 0usize;
    while let Some(row) = result.fetch_row()? {
        println!("{}", serde_json::to_string(&row)?);
        printed += 1;
    }
    result.close();
    Ok(printed)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(args) = parse_args(&args)? else {
        return Ok(());
    };
    init_logging();

    let mut config = match &args.config {
        Some(path) => DatabaseConfig::from_file(path)?,
        None => DatabaseConfig::in_memory(),
    };
    if let Some(path) = args.db {
        config.path = path;
    }

    let host = HostLoop::new().context("failed to start host loop")?;
    let handlers = args
        .host_fs
        .then(|| FileSystemHandlers::from_host(StdHostFileSystem::new()));
    let db = Database::new(&host, config, handlers);

    let (ready_tx, ready_rx) = oneshot::channel();
    db.init(move |outcome| {
        let _ = ready_tx.send(outcome);
    })?;
    host.run_until(async { ready_rx.await })
        .context("initialization callback was dropped")??;
    info!(path = db.config().path(), "Database initialized");

    let conn = db.connect()?;
    let result = host.run_until(conn.execute(args.sql.as_str(), args.mode))?;
    let columns = result.describe()?.len();
    debug!(result_type = ?result.result_type(), columns, "Query finished");

    // Streaming rows may call host handlers, so the host loop keeps running
    // while another thread drains the cursor.
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(print_rows(result));
    });
    let printed = host
        .run_until(async { done_rx.await })
        .context("row printer exited early")??;
    info!(rows = printed, "Done");

    db.close()?;
    Ok(())
}
