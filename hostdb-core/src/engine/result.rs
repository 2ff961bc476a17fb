//! Query results.
//!
//! A [`QueryResult`] owns the engine output of one query. Materialized
//! results hold every row; streaming results pull rows from a producer
//! thread that is still stepping the statement.
//!
//! Only one stream can be active on a connection. Starting any newer query
//! on the same connection supersedes the stream: its producer stops and the
//! next fetch fails with [`EngineError::StreamSuperseded`]. Fetching from or
//! describing a result after [`QueryResult::close`] fails with
//! [`EngineError::ResultClosed`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use rusqlite::types::ValueRef;
use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

pub type Row = Vec<Value>;

/// Column name and declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub decl_type: Option<String>,
}

/// Result type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Materialized,
    Streaming,
}

/// Fully buffered result.
#[derive(Debug)]
pub struct MaterializedResult {
    columns: Vec<Column>,
    rows: VecDeque<Row>,
    closed: bool,
}

impl MaterializedResult {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            closed: false,
        }
    }

    /// Rows not fetched yet.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

/// Messages from a streaming producer thread.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Row(Row),
    Failed(EngineError),
}

/// Which query a connection is currently serving. Every query start takes a
/// new ticket; a ticket goes stale as soon as a newer one is issued.
#[derive(Debug, Clone)]
pub(crate) struct StreamTicket {
    current: Arc<AtomicU64>,
    issued: u64,
}

impl StreamTicket {
    pub(crate) fn issue(current: &Arc<AtomicU64>) -> Self {
        let issued = current.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            current: current.clone(),
            issued,
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.current.load(Ordering::Acquire) != self.issued
    }
}

/// Incremental cursor over rows produced on another thread.
///
/// Rows are computed while the consumer fetches. If the query reads files
/// through host handlers, fetch from a thread other than the host loop's.
#[derive(Debug)]
pub struct StreamingResult {
    columns: Vec<Column>,
    events: Option<Receiver<StreamEvent>>,
    ticket: Option<StreamTicket>,
    superseded: bool,
    closed: bool,
}

impl StreamingResult {
    pub(crate) fn new(columns: Vec<Column>, events: Receiver<StreamEvent>) -> Self {
        Self {
            columns,
            events: Some(events),
            ticket: None,
            superseded: false,
            closed: false,
        }
    }

    /// Tie the stream to its connection's query ticket.
    pub(crate) fn with_ticket(mut self, ticket: StreamTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    fn is_stale(&self) -> bool {
        self.ticket.as_ref().is_some_and(StreamTicket::is_stale)
    }

    fn supersede(&mut self) -> EngineError {
        debug!("Streaming result superseded by a newer query");
        self.events = None;
        self.superseded = true;
        EngineError::StreamSuperseded
    }

    fn next_row(&mut self) -> Result<Option<Row>, EngineError> {
        if self.superseded {
            return Err(EngineError::StreamSuperseded);
        }
        if self.events.is_none() {
            return Ok(None);
        }
        if self.is_stale() {
            return Err(self.supersede());
        }
        let Some(events) = &self.events else {
            return Ok(None);
        };
        match events.recv() {
            Ok(StreamEvent::Row(row)) => Ok(Some(row)),
            Ok(StreamEvent::Failed(err)) => {
                self.events = None;
                Err(err)
            }
            // The producer also hangs up when a newer query takes over.
            Err(_) if self.is_stale() => Err(self.supersede()),
            Err(_) => {
                self.events = None;
                Ok(None)
            }
        }
    }
}

/// The result of one query, tagged by how it was produced.
#[derive(Debug)]
pub enum QueryResult {
    Materialized(MaterializedResult),
    Streaming(StreamingResult),
}

impl QueryResult {
    pub fn result_type(&self) -> ResultType {
        match self {
            QueryResult::Materialized(_) => ResultType::Materialized,
            QueryResult::Streaming(_) => ResultType::Streaming,
        }
    }

    /// Column names and declared types.
    pub fn describe(&self) -> Result<&[Column], EngineError> {
        match self {
            QueryResult::Materialized(r) if r.closed => Err(EngineError::ResultClosed),
            QueryResult::Materialized(r) => Ok(&r.columns),
            QueryResult::Streaming(r) if r.closed => Err(EngineError::ResultClosed),
            QueryResult::Streaming(r) => Ok(&r.columns),
        }
    }

    /// Next row, or `None` once the result is exhausted.
    pub fn fetch_row(&mut self) -> Result<Option<Row>, EngineError> {
        match self {
            QueryResult::Materialized(r) if r.closed => Err(EngineError::ResultClosed),
            QueryResult::Materialized(r) => Ok(r.rows.pop_front()),
            QueryResult::Streaming(r) if r.closed => Err(EngineError::ResultClosed),
            QueryResult::Streaming(r) => r.next_row(),
        }
    }

    /// Every remaining row.
    pub fn fetch_all_rows(&mut self) -> Result<Vec<Row>, EngineError> {
        if let QueryResult::Materialized(r) = self {
            if r.closed {
                return Err(EngineError::ResultClosed);
            }
            return Ok(r.rows.drain(..).collect());
        }
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Release the result. A streaming producer stops at its next row.
    pub fn close(&mut self) {
        match self {
            QueryResult::Materialized(r) => {
                r.closed = true;
                r.rows.clear();
            }
            QueryResult::Streaming(r) => {
                r.closed = true;
                if r.events.take().is_some() {
                    debug!("Streaming result closed by consumer");
                }
            }
        }
    }

    /// Returns `true` after [`close`](Self::close), and for a streaming
    /// result once it has been drained or superseded.
    pub fn is_closed(&self) -> bool {
        match self {
            QueryResult::Materialized(r) => r.closed,
            QueryResult::Streaming(r) => r.closed || r.events.is_none(),
        }
    }
}
