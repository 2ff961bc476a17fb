//! Executor - Async Query Execution On Dedicated Worker Threads
//!
//! Each query runs on its own named worker thread so the host loop never
//! blocks on the engine. The host awaits a [`QueryFuture`], which settles
//! exactly once with the query's [`QueryResult`] or a [`QueryError`].
//!
//! # Lifecycle:
//! `Pending -> Running -> Succeeded | Failed`, observable through
//! [`QueryFuture::state`].
//!
//! # Failure mapping:
//! - Engine errors reject with [`QueryError::Execution`] and the engine's
//!   message
//! - Panics on the worker reject with [`QueryError::Unknown`]
//!
//! There is no cancellation or retry. Dropping the future leaves the worker
//! running; its result is discarded.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{EngineConnection, QueryResult};
use crate::error::QueryError;

/// Message for failures the engine did not classify.
pub const UNKNOWN_QUERY_ERROR: &str =
    "Unknown Error: Something happened during execution of the query";

/// How the engine should produce rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Materialized,
    Streaming,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "materialized" => Ok(ExecutionMode::Materialized),
            "streaming" => Ok(ExecutionMode::Streaming),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryState {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
}

impl QueryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => QueryState::Pending,
            1 => QueryState::Running,
            2 => QueryState::Succeeded,
            _ => QueryState::Failed,
        }
    }
}

/// One query to run.
pub struct QueryExecutionRequest {
    pub sql: String,
    pub connection: Arc<dyn EngineConnection>,
    pub mode: ExecutionMode,
}

impl QueryExecutionRequest {
    pub fn new(
        connection: Arc<dyn EngineConnection>,
        sql: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            sql: sql.into(),
            connection,
            mode,
        }
    }
}

/// Future half of a query. Resolves on whichever loop polls it.
pub struct QueryFuture {
    receiver: oneshot::Receiver<Result<QueryResult, QueryError>>,
    state: Arc<AtomicU8>,
}

impl QueryFuture {
    /// A future that is already rejected with `error`.
    pub fn rejected(error: QueryError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        QueryFuture {
            receiver: rx,
            state: Arc::new(AtomicU8::new(QueryState::Failed as u8)),
        }
    }

    pub fn state(&self) -> QueryState {
        QueryState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl Future for QueryFuture {
    type Output = Result<QueryResult, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(QueryError::Dropped)))
    }
}

/// Start `request` on a fresh worker thread.
pub fn execute(request: QueryExecutionRequest) -> QueryFuture {
    let (tx, rx) = oneshot::channel();
    let state = Arc::new(AtomicU8::new(QueryState::Pending as u8));
    let worker_state = state.clone();

    let spawned = thread::Builder::new()
        .name("hostdb-query".to_string())
        .spawn(move || {
            worker_state.store(QueryState::Running as u8, Ordering::Release);
            let settled = run(&request);
            let final_state = if settled.is_ok() {
                QueryState::Succeeded
            } else {
                QueryState::Failed
            };
            worker_state.store(final_state as u8, Ordering::Release);
            if tx.send(settled).is_err() {
                debug!(mode = ?request.mode, "Query future dropped, discarding result");
            }
        });

    if let Err(e) = spawned {
        // The sender went down with the closure; the future reports Dropped.
        warn!(error = %e, "Failed to spawn query worker");
        state.store(QueryState::Failed as u8, Ordering::Release);
    }

    QueryFuture { receiver: rx, state }
}

fn run(request: &QueryExecutionRequest) -> Result<QueryResult, QueryError> {
    debug!(mode = ?request.mode, sql = %request.sql, "Executing query");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match request.mode {
        ExecutionMode::Materialized => request
            .connection
            .query(&request.sql)
            .map(QueryResult::Materialized),
        ExecutionMode::Streaming => request
            .connection
            .send_query(&request.sql)
            .map(QueryResult::Streaming),
    }));

    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => {
            debug!(error = %e, "Query failed");
            Err(QueryError::Execution(e.to_string()))
        }
        Err(_) => {
            warn!(sql = %request.sql, "Query worker panicked");
            Err(QueryError::Unknown(UNKNOWN_QUERY_ERROR.to_string()))
        }
    }
}
