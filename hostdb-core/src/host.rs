//! Host Loop - Single-Threaded Cooperative Executor
//!
//! Every host-side handler (filesystem callbacks, readiness callbacks) lives on
//! one thread and runs cooperatively, the way callbacks in an embedding
//! scripting runtime would. The loop is a tokio current-thread runtime driving
//! a [`LocalSet`], so handlers only need to be `'static`, not `Send`.
//!
//! Work reaches the loop in two ways:
//! - [`crate::bridge::CallbackChannel`] dispatchers spawned on the local set
//! - futures the host awaits through [`HostLoop::run_until`]
//!
//! The loop only makes progress while the owning thread is inside
//! `run_until`. A thread blocked in a bridge call waits for exactly that.

use std::future::Future;
use std::thread::{self, ThreadId};

use tokio::runtime::{Builder, Runtime};
use tokio::task::LocalSet;
use tracing::debug;

/// The single-threaded host loop.
///
/// `HostLoop` is `!Send`: it belongs to the thread that created
/// it, and that thread is the only one allowed to drive it.
pub struct HostLoop {
    runtime: Runtime,
    local: LocalSet,
    thread: ThreadId,
}

impl HostLoop {
    /// Create a host loop bound to the calling thread.
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let thread = thread::current().id();
        debug!(?thread, "Creating host loop");
        Ok(Self {
            runtime,
            local: LocalSet::new(),
            thread,
        })
    }

    /// Drive the loop until `future` resolves.
    ///
    /// Channel dispatchers and other local tasks keep running while the
    /// future is pending.
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }

    /// Queue a task on the loop. It starts running on the next `run_until`.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(future);
    }

    /// Identity of the thread that owns this loop.
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Returns `true` when called from the loop's own thread.
    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}
