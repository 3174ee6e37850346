//! Request channel between caller threads and the poller
//!
//! Callers never touch the registry. They enqueue a request, wake the
//! poller through the port's user event, and block on a private one-slot
//! reply channel until the poller has served the request.

use crate::error::{Result, WatchError};
use crate::event::Interest;
use crate::handle::WatchHandle;
use crate::platform::PortWaker;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Work a caller asks the poller to do
pub(crate) enum Request {
    Register { path: PathBuf, interest: Interest },
    Cancel(WatchHandle),
    UpdateInterest { handle: WatchHandle, interest: Interest },
    Close,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { path, interest } => write!(f, "Register({}, {:?})", path.display(), interest),
            Self::Cancel(handle) => write!(f, "Cancel({})", handle.path().display()),
            Self::UpdateInterest { handle, interest } => {
                write!(f, "UpdateInterest({}, {:?})", handle.path().display(), interest)
            }
            Self::Close => write!(f, "Close"),
        }
    }
}

/// Outcome of a served request
#[derive(Debug)]
pub(crate) enum Reply {
    Registered(WatchHandle),
    Done,
}

/// Single-use slot the poller fills exactly once
pub(crate) struct ReplySlot(Sender<Result<Reply>>);

impl ReplySlot {
    pub(crate) fn fill(self, result: Result<Reply>) {
        // The submitter blocks until filled, so a send only fails if it panicked
        let _ = self.0.send(result);
    }
}

/// A request in flight together with its reply slot
pub(crate) struct Envelope {
    pub(crate) request: Request,
    pub(crate) reply: ReplySlot,
}

/// Sending half of the request channel, shared by the service and its handles
pub(crate) struct RequestChannel {
    tx: Sender<Envelope>,
    waker: Arc<dyn PortWaker>,
}

impl RequestChannel {
    pub(crate) fn new(waker: Arc<dyn PortWaker>) -> (Self, Receiver<Envelope>) {
        let (tx, rx) = unbounded();
        (Self { tx, waker }, rx)
    }

    /// Hand `request` to the poller and wait for its reply
    ///
    /// Fails with [`WatchError::FacilityClosed`] if the poller has exited or
    /// exits before serving the request.
    pub(crate) fn submit(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                request,
                reply: ReplySlot(reply_tx),
            })
            .map_err(|_| WatchError::FacilityClosed)?;

        self.waker
            .send_user_event()
            .map_err(|_| WatchError::FacilityClosed)?;

        reply_rx.recv().map_err(|_| WatchError::FacilityClosed)?
    }
}
