//! Requests and their single-assignment result slots.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::resp::types::{Arg, RespValue};

/// Receiving half of a [`ResultSlot`], held by the caller.
pub type SlotReceiver = oneshot::Receiver<Result<RespValue>>;

/// The resolving half of a request's result: set exactly once, with
/// either a value or an error.
///
/// Consuming `self` on resolution makes a second assignment impossible.
/// Dropping an unresolved slot wakes the caller with a receive error,
/// which the client maps to [`Error::Closed`].
#[derive(Debug)]
pub struct ResultSlot {
    tx: oneshot::Sender<Result<RespValue>>,
}

impl ResultSlot {
    pub fn new() -> (Self, SlotReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Resolve with a decoded reply or a failure.
    pub fn resolve(self, result: Result<RespValue>) {
        // The caller may have stopped waiting (timeout, drop).
        let _ = self.tx.send(result);
    }

    pub fn fail(self, cause: Error) {
        self.resolve(Err(cause));
    }

    /// True when nobody is waiting for the result any more.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One command on its way to a connection.
#[derive(Debug)]
pub struct Request {
    pub args: Arc<[Arg]>,
    /// `None` for fire-and-forget requests: written, reply read and dropped.
    pub slot: Option<ResultSlot>,
}

impl Request {
    /// A request whose result the caller awaits on the returned receiver.
    pub fn new(args: impl Into<Arc<[Arg]>>) -> (Self, SlotReceiver) {
        let (slot, rx) = ResultSlot::new();
        (
            Self {
                args: args.into(),
                slot: Some(slot),
            },
            rx,
        )
    }

    pub fn fire_and_forget(args: impl Into<Arc<[Arg]>>) -> Self {
        Self {
            args: args.into(),
            slot: None,
        }
    }

    /// Fail the request's slot, if it has one.
    pub fn fail(self, cause: Error) {
        if let Some(slot) = self.slot {
            slot.fail(cause);
        }
    }

    /// Command name, for logging.
    pub fn name(&self) -> String {
        self.args.first().map(|a| a.to_string()).unwrap_or_default()
    }
}
