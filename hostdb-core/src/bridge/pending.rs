//! Per-invocation rendezvous between a blocked caller and a host handler.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::BridgeError;

enum Slot<R> {
    Waiting,
    Settled(Result<R, BridgeError>),
    Taken,
}

/// State of one bridge call: a result slot guarded by a mutex plus a
/// condition variable owned by this call alone, so concurrent callers on the
/// same channel never wake each other.
pub(crate) struct PendingCall<R> {
    slot: Mutex<Slot<R>>,
    signal: Condvar,
}

impl<R> PendingCall<R> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Waiting),
            signal: Condvar::new(),
        })
    }

    /// Store the outcome and wake the caller. Only the first settle counts.
    pub(crate) fn settle(&self, outcome: Result<R, BridgeError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Waiting) {
            return false;
        }
        *slot = Slot::Settled(outcome);
        self.signal.notify_one();
        true
    }

    /// Block until settled. Unbounded: a stalled host loop blocks forever.
    pub(crate) fn wait(&self) -> Result<R, BridgeError> {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Settled(outcome) => return outcome,
                Slot::Waiting => {
                    *slot = Slot::Waiting;
                    self.signal.wait(&mut slot);
                }
                Slot::Taken => unreachable!("pending call consumed twice"),
            }
        }
    }

    /// Block until settled or until `deadline` passes. Wakeups that find the
    /// slot still empty go back to waiting for the same deadline.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Result<R, BridgeError>> {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Settled(outcome) => return Some(outcome),
                Slot::Waiting => {
                    *slot = Slot::Waiting;
                    if self.signal.wait_until(&mut slot, deadline).timed_out() {
                        if let Slot::Settled(_) = &*slot {
                            continue;
                        }
                        return None;
                    }
                }
                Slot::Taken => unreachable!("pending call consumed twice"),
            }
        }
    }
}

/// The `done` continuation handed to a host handler.
///
/// Consuming it with [`complete`](Self::complete) or [`fail`](Self::fail)
/// signals the blocked caller exactly once. Dropping it unsignalled delivers
/// [`BridgeError::Abandoned`] (or [`BridgeError::Panicked`] while unwinding),
/// so a caller can never be left waiting on a handler that forgot it.
pub struct Completion<R> {
    pending: Option<Arc<PendingCall<R>>>,
    channel: Arc<str>,
}

impl<R> Completion<R> {
    pub(crate) fn new(pending: Arc<PendingCall<R>>, channel: Arc<str>) -> Self {
        Self {
            pending: Some(pending),
            channel,
        }
    }

    /// Deliver a successful result.
    pub fn complete(mut self, value: R) {
        if let Some(pending) = self.pending.take() {
            pending.settle(Ok(value));
        }
    }

    /// Deliver a handler-side failure to the caller.
    pub fn fail(mut self, message: impl Into<String>) {
        if let Some(pending) = self.pending.take() {
            pending.settle(Err(BridgeError::Handler(message.into())));
        }
    }

    /// Name of the channel this call arrived on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let err = if std::thread::panicking() {
            BridgeError::Panicked {
                channel: self.channel.to_string(),
                message: "handler panicked before completing".to_string(),
            }
        } else {
            BridgeError::Abandoned(self.channel.to_string())
        };
        pending.settle(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_settle_only_once() {
        let pending = PendingCall::<u32>::new();
        assert!(pending.settle(Ok(1)));
        assert!(!pending.settle(Ok(2)));
        assert_eq!(pending.wait(), Ok(1));
    }

    #[test]
    fn test_wait_blocks_until_settled_from_other_thread() {
        let pending = PendingCall::<String>::new();
        let remote = pending.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.settle(Ok("done".to_string()));
        });
        assert_eq!(pending.wait().unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let pending = PendingCall::<u8>::new();
        assert!(pending
            .wait_until(Instant::now() + Duration::from_millis(10))
            .is_none());
    }

    #[test]
    fn test_wakeups_do_not_extend_deadline() {
        let pending = PendingCall::<u8>::new();
        let stop = Arc::new(AtomicBool::new(false));
        let (remote, stop_remote) = (pending.clone(), stop.clone());
        // Wake the waiter every few milliseconds without settling it.
        let nudger = thread::spawn(move || {
            while !stop_remote.load(Ordering::Acquire) {
                remote.signal.notify_one();
                thread::sleep(Duration::from_millis(5));
            }
        });

        let start = Instant::now();
        assert!(pending
            .wait_until(start + Duration::from_millis(30))
            .is_none());
        let waited = start.elapsed();
        stop.store(true, Ordering::Release);
        nudger.join().unwrap();

        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[test]
    fn test_completion_fail_delivers_handler_error() {
        let pending = PendingCall::<u8>::new();
        Completion::new(pending.clone(), Arc::from("read")).fail("no such file");
        assert_eq!(
            pending.wait(),
            Err(BridgeError::Handler("no such file".to_string()))
        );
    }

    #[test]
    fn test_dropped_completion_is_abandoned() {
        let pending = PendingCall::<u8>::new();
        drop(Completion::new(pending.clone(), Arc::from("glob")));
        assert_eq!(
            pending.wait(),
            Err(BridgeError::Abandoned("glob".to_string()))
        );
    }
}
