#![forbid(unsafe_code)]

//! Hand-off from other threads into the serial context.
//!
//! Observable state lives on one thread. Background work that wants to
//! change it posts a closure through a [`SerialHandle`]; the serial thread
//! runs posted closures, in posting order, at the start of every
//! [`run_pending`](crate::run_pending) or [`step`](crate::step) call (or on
//! [`drain_handoff`]).
//!
//! ```ignore
//! let handle = ftui_observe::handoff();
//! std::thread::spawn(move || {
//!     let total = expensive_sum();
//!     handle.post(move || MODEL.with(|m| m.total.set(total))).ok();
//! });
//! ```

use std::cell::RefCell;
use std::fmt;
use std::sync::mpsc;

use tracing::trace;

use crate::error::HandoffClosed;

type Job = Box<dyn FnOnce() + Send>;

struct Inbox {
    sender: mpsc::Sender<Job>,
    receiver: mpsc::Receiver<Job>,
}

thread_local! {
    static INBOX: RefCell<Option<Inbox>> = const { RefCell::new(None) };
}

/// Sending half of the current thread's serial inbox. `Send + Clone`.
#[derive(Clone)]
pub struct SerialHandle {
    sender: mpsc::Sender<Job>,
}

impl fmt::Debug for SerialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialHandle").finish_non_exhaustive()
    }
}

impl SerialHandle {
    /// Queue `job` to run on the serial thread.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffClosed`] if the serial thread has exited.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), HandoffClosed> {
        self.sender.send(Box::new(job)).map_err(|_| HandoffClosed)
    }
}

/// Handle for posting work to the calling thread's serial context.
#[must_use]
pub fn handoff() -> SerialHandle {
    INBOX.with(|inbox| {
        let mut inbox = inbox.borrow_mut();
        let inbox = inbox.get_or_insert_with(|| {
            let (sender, receiver) = mpsc::channel();
            Inbox { sender, receiver }
        });
        SerialHandle {
            sender: inbox.sender.clone(),
        }
    })
}

/// Run every job posted so far. Returns how many ran.
///
/// Jobs posted by the jobs themselves run in the same call.
pub fn drain_handoff() -> usize {
    drain()
}

pub(crate) fn drain() -> usize {
    let mut ran = 0;
    loop {
        let job = INBOX.with(|inbox| {
            inbox
                .borrow()
                .as_ref()
                .and_then(|inbox| inbox.receiver.try_recv().ok())
        });
        let Some(job) = job else {
            break;
        };
        job();
        ran += 1;
    }
    if ran > 0 {
        trace!(ran, "handed-off jobs drained");
    }
    ran
}
