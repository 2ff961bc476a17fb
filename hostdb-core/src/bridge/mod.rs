//! Bridge - Synchronous Calls From Native Threads Onto The Host Loop
//!
//! A [`CallbackChannel`] binds one host-side handler to a FIFO request queue.
//! Any non-host thread can [`invoke`](CallbackChannel::invoke) it: the request
//! is queued, the caller blocks on a per-request condition variable, and the
//! dispatcher running on the host loop executes the handler and signals the
//! caller through the handler's [`Completion`].
//!
//! # Guarantees:
//! - Calls on one channel start on the host loop in submission order
//! - No ordering between different channels
//! - `release()` is idempotent; `invoke` after release fails fast with
//!   [`BridgeError::ChannelClosed`]
//! - Handler failures (explicit, dropped completion, panic) reach the caller
//!   as a typed [`BridgeError`]
//!
//! # Precondition:
//! `invoke` must never run on the host loop's own thread. The host loop would
//! wait on itself forever; debug builds assert on it.
//!
//! There is no cancellation. Without a `call_timeout` a stalled host loop
//! blocks the caller indefinitely.

mod pending;

pub use pending::Completion;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::host::HostLoop;
use pending::PendingCall;

/// Pause between attempts to claim a slot on a full bounded queue when the
/// call has a deadline.
const ENQUEUE_RETRY: Duration = Duration::from_millis(1);

struct Request<A, R> {
    args: A,
    completion: Completion<R>,
}

enum QueueSender<A, R> {
    Unbounded(mpsc::UnboundedSender<Request<A, R>>),
    Bounded(mpsc::Sender<Request<A, R>>),
}

enum QueueReceiver<A, R> {
    Unbounded(mpsc::UnboundedReceiver<Request<A, R>>),
    Bounded(mpsc::Receiver<Request<A, R>>),
}

impl<A, R> QueueReceiver<A, R> {
    async fn recv(&mut self) -> Option<Request<A, R>> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Queue and wait settings for a channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelOptions {
    /// Maximum queued calls. `None` means unbounded; when bounded, `invoke`
    /// blocks until the host loop frees a slot.
    pub capacity: Option<usize>,
    /// How long a caller waits, from `invoke` until the handler completes
    /// (queueing included), before giving up with [`BridgeError::Timeout`].
    /// `None` waits forever.
    pub call_timeout: Option<Duration>,
}

struct ChannelInner<A, R> {
    name: Arc<str>,
    released: AtomicBool,
    sender: Mutex<Option<QueueSender<A, R>>>,
    host_thread: ThreadId,
    call_timeout: Option<Duration>,
}

/// A named, reusable conduit from any thread to one handler on the host loop.
///
/// Cloning is cheap and every clone refers to the same queue and release
/// state.
pub struct CallbackChannel<A, R> {
    inner: Arc<ChannelInner<A, R>>,
}

impl<A, R> Clone for CallbackChannel<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Send + 'static, R: Send + 'static> CallbackChannel<A, R> {
    /// Bind `handler` to a new unbounded channel on `host`.
    pub fn create<H>(host: &HostLoop, name: impl Into<String>, handler: H) -> Self
    where
        H: FnMut(A, Completion<R>) + 'static,
    {
        ChannelBuilder::new(name).build(host, handler)
    }

    /// Run the handler on the host loop with `args` and wait for its result.
    pub fn invoke(&self, args: A) -> Result<R, BridgeError> {
        let inner = &self.inner;
        debug_assert_ne!(
            thread::current().id(),
            inner.host_thread,
            "bridge call on channel '{}' issued from the host loop thread",
            inner.name
        );

        let deadline = inner.call_timeout.map(|timeout| Instant::now() + timeout);
        let pending = PendingCall::new();
        let request = Request {
            args,
            completion: Completion::new(pending.clone(), inner.name.clone()),
        };
        self.enqueue(request, deadline)?;
        trace!(channel = %inner.name, "Bridge call enqueued");

        match deadline {
            None => pending.wait(),
            Some(deadline) => pending.wait_until(deadline).unwrap_or_else(|| Err(self.timed_out())),
        }
    }

    fn enqueue(&self, request: Request<A, R>, deadline: Option<Instant>) -> Result<(), BridgeError> {
        let closed = || BridgeError::ChannelClosed(self.inner.name.to_string());
        // Never block on a full queue while holding the lock: release() runs
        // on the host loop, which is also what frees queue slots.
        let bounded = {
            let guard = self.inner.sender.lock();
            match guard.as_ref() {
                None => return Err(closed()),
                Some(QueueSender::Unbounded(tx)) => {
                    return tx.send(request).map_err(|_| closed())
                }
                Some(QueueSender::Bounded(tx)) => tx.clone(),
            }
        };

        let Some(deadline) = deadline else {
            return bounded.blocking_send(request).map_err(|_| closed());
        };
        let mut request = request;
        loop {
            match bounded.try_send(request) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(closed()),
                Err(TrySendError::Full(back)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timed_out());
                    }
                    request = back;
                    thread::sleep(ENQUEUE_RETRY.min(deadline - now));
                }
            }
        }
    }

    fn timed_out(&self) -> BridgeError {
        warn!(channel = %self.inner.name, timeout = ?self.inner.call_timeout, "Bridge call timed out");
        BridgeError::Timeout(self.inner.name.to_string())
    }
}

impl<A, R> CallbackChannel<A, R> {
    /// Close the channel. Repeated calls are no-ops.
    ///
    /// Calls already queued still run; the finalizer runs on the host loop
    /// after the last of them.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = self.inner.sender.lock().take();
        drop(sender);
        debug!(channel = %self.inner.name, "Callback channel released");
    }

    /// Returns `true` once [`release`](Self::release) has been called.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// Builder for [`CallbackChannel`].
pub struct ChannelBuilder {
    name: String,
    options: ChannelOptions,
    finalizer: Option<Box<dyn FnOnce()>>,
}

impl ChannelBuilder {
    /// Start configuring a channel named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ChannelOptions::default(),
            finalizer: None,
        }
    }

    /// Bound the queue to `capacity` pending calls.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.options.capacity = Some(capacity.max(1));
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.options.call_timeout = Some(timeout);
        self
    }

    pub fn options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `finalizer` on the host loop once the channel is released and
    /// drained.
    pub fn on_release<F: FnOnce() + 'static>(mut self, finalizer: F) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Bind `handler` and spawn the channel's dispatcher on `host`.
    pub fn build<A, R, H>(self, host: &HostLoop, handler: H) -> CallbackChannel<A, R>
    where
        A: Send + 'static,
        R: Send + 'static,
        H: FnMut(A, Completion<R>) + 'static,
    {
        let (sender, receiver) = match self.options.capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
        };

        let name: Arc<str> = Arc::from(self.name);
        debug!(channel = %name, capacity = ?self.options.capacity, "Creating callback channel");
        host.spawn_local(dispatch(name.clone(), receiver, handler, self.finalizer));

        CallbackChannel {
            inner: Arc::new(ChannelInner {
                name,
                released: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                host_thread: host.thread_id(),
                call_timeout: self.options.call_timeout,
            }),
        }
    }
}

/// Drain the queue one request at a time on the host loop.
async fn dispatch<A, R, H>(
    name: Arc<str>,
    mut receiver: QueueReceiver<A, R>,
    mut handler: H,
    finalizer: Option<Box<dyn FnOnce()>>,
) where
    H: FnMut(A, Completion<R>),
{
    while let Some(Request { args, completion }) = receiver.recv().await {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(args, completion)));
        if let Err(payload) = outcome {
            warn!(channel = %name, panic = %panic_message(&payload), "Host handler panicked");
        }
    }

    debug!(channel = %name, "Callback channel drained");
    if let Some(finalizer) = finalizer {
        finalizer();
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use tokio::sync::oneshot;

    /// Run the host loop until the worker thread finishes, returning its output.
    fn drive<T: Send + 'static>(host: &HostLoop, work: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = oneshot::channel();
        thread::spawn(move || {
            let _ = tx.send(work());
        });
        host.run_until(async { rx.await.expect("worker thread panicked") })
    }

    #[test]
    fn test_invoke_returns_handler_result() {
        let host = HostLoop::new().unwrap();
        let channel = CallbackChannel::create(&host, "double", |n: u64, done: Completion<u64>| {
            done.complete(n * 2)
        });
        let remote = channel.clone();
        assert_eq!(drive(&host, move || remote.invoke(21)), Ok(42));
    }

    #[test]
    fn test_handler_runs_on_host_thread() {
        let host = HostLoop::new().unwrap();
        let host_id = host.thread_id();
        let channel = CallbackChannel::create(&host, "where", |_: (), done: Completion<ThreadId>| {
            done.complete(thread::current().id())
        });
        let remote = channel.clone();
        assert_eq!(drive(&host, move || remote.invoke(())).unwrap(), host_id);
    }

    #[test]
    fn test_handler_failure_reaches_caller() {
        let host = HostLoop::new().unwrap();
        let channel = CallbackChannel::create(&host, "fails", |_: (), done: Completion<()>| {
            done.fail("permission denied")
        });
        let remote = channel.clone();
        assert_eq!(
            drive(&host, move || remote.invoke(())),
            Err(BridgeError::Handler("permission denied".to_string()))
        );
    }

    #[test]
    fn test_handler_panic_reaches_caller_and_channel_survives() {
        let host = HostLoop::new().unwrap();
        let channel = CallbackChannel::create(&host, "flaky", |n: u8, done: Completion<u8>| {
            if n == 0 {
                panic!("zero");
            }
            done.complete(n)
        });
        let remote = channel.clone();
        let (first, second) = drive(&host, move || (remote.invoke(0), remote.invoke(5)));
        assert!(matches!(first, Err(BridgeError::Panicked { .. })));
        assert_eq!(second, Ok(5));
    }

    #[test]
    fn test_deferred_completion_from_local_task() {
        let host = HostLoop::new().unwrap();
        let channel = CallbackChannel::create(&host, "deferred", |n: u32, done: Completion<u32>| {
            tokio::task::spawn_local(async move {
                tokio::task::yield_now().await;
                done.complete(n + 1);
            });
        });
        let remote = channel.clone();
        assert_eq!(drive(&host, move || remote.invoke(1)), Ok(2));
    }

    #[test]
    fn test_release_is_idempotent_and_runs_finalizer_once() {
        let host = HostLoop::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        let counter = finalized.clone();
        let channel = ChannelBuilder::new("once")
            .on_release(move || counter.set(counter.get() + 1))
            .build(&host, |_: (), done: Completion<()>| done.complete(()));

        channel.release();
        channel.release();
        channel.clone().release();
        host.run_until(tokio::task::yield_now());
        host.run_until(tokio::task::yield_now());

        assert!(channel.is_released());
        assert_eq!(finalized.get(), 1);
    }

    #[test]
    fn test_invoke_after_release_fails_without_blocking() {
        let host = HostLoop::new().unwrap();
        let channel = CallbackChannel::create(&host, "closed", |_: (), done: Completion<()>| {
            done.complete(())
        });
        channel.release();
        let remote = channel.clone();
        // The host loop is never driven here: a hang would fail the test.
        let result = thread::spawn(move || remote.invoke(())).join().unwrap();
        assert_eq!(result, Err(BridgeError::ChannelClosed("closed".to_string())));
    }

    #[test]
    fn test_fifo_order_across_callers() {
        let host = HostLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let channel = CallbackChannel::create(&host, "fifo", move |n: usize, done: Completion<()>| {
            log.borrow_mut().push(n);
            done.complete(())
        });

        // Submission order is fixed by handing a token from one caller to
        // the next: caller i only enqueues after caller i-1 has enqueued.
        let (token_tx, token_rx) = std::sync::mpsc::channel::<usize>();
        let token_rx = Arc::new(std::sync::Mutex::new(token_rx));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let remote = channel.clone();
            let token_tx = token_tx.clone();
            let token_rx = token_rx.clone();
            workers.push(thread::spawn(move || {
                let ticket = token_rx.lock().unwrap().recv().unwrap();
                let remote_inner = remote.clone();
                let call = thread::spawn(move || remote_inner.invoke(ticket));
                // Give the call time to reach the queue before passing the token.
                thread::sleep(Duration::from_millis(5));
                let _ = token_tx.send(ticket + 1);
                call.join().unwrap()
            }));
        }
        token_tx.send(0).unwrap();
        let all = drive(&host, move || {
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert!(all.iter().all(|r| r.is_ok()));
        assert_eq!(*seen.borrow(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_thread_submission_order_is_preserved() {
        let host = HostLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let channel = CallbackChannel::create(&host, "seq", move |n: u32, done: Completion<u32>| {
            log.borrow_mut().push(n);
            done.complete(n)
        });
        let remote = channel.clone();
        drive(&host, move || {
            for n in 0..50 {
                remote.invoke(n).unwrap();
            }
        });
        assert_eq!(*seen.borrow(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_channel_applies_backpressure() {
        let host = HostLoop::new().unwrap();
        let channel = ChannelBuilder::new("bounded")
            .capacity(1)
            .build(&host, |n: u32, done: Completion<u32>| done.complete(n));

        let results = {
            let remote = channel.clone();
            drive(&host, move || {
                let callers: Vec<_> = (0..4)
                    .map(|n| {
                        let remote = remote.clone();
                        thread::spawn(move || remote.invoke(n))
                    })
                    .collect();
                callers
                    .into_iter()
                    .map(|c| c.join().unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let mut values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_call_timeout_when_host_stalls() {
        let host = HostLoop::new().unwrap();
        let channel = ChannelBuilder::new("slow")
            .call_timeout(Duration::from_millis(20))
            .build(&host, |_: (), done: Completion<()>| done.complete(()));
        let remote = channel.clone();
        // Host loop is never driven, so the handler cannot run.
        let result = thread::spawn(move || remote.invoke(())).join().unwrap();
        assert_eq!(result, Err(BridgeError::Timeout("slow".to_string())));
    }

    #[test]
    fn test_call_timeout_covers_full_bounded_queue() {
        let host = HostLoop::new().unwrap();
        let channel = ChannelBuilder::new("narrow")
            .capacity(1)
            .call_timeout(Duration::from_millis(20))
            .build(&host, |_: u8, done: Completion<()>| done.complete(()));

        // The host loop is never driven: the first call takes the only slot,
        // the second cannot enqueue at all. Both must still give up.
        let (tx, rx) = std::sync::mpsc::channel();
        for n in 0..2u8 {
            let remote = channel.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send(remote.invoke(n));
            });
        }
        for _ in 0..2 {
            let result = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("bridge call ignored its timeout");
            assert_eq!(result, Err(BridgeError::Timeout("narrow".to_string())));
        }
    }
}
