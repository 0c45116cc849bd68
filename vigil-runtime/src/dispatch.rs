//! Callback verdicts and the dispatch-boundary guard.
//!
//! Every handler, timer, task and service callback is invoked through
//! [`invoke_guarded`], which turns panics and callback errors into a logged
//! verdict instead of letting them unwind into the reactor or a worker
//! thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Error type callbacks may return to deactivate themselves.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler or timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the registration active.
    Continue,
    /// Deactivate this registration.
    Done,
}

impl Dispatch {
    /// Check if the verdict keeps the registration alive.
    pub fn is_continue(&self) -> bool {
        matches!(self, Dispatch::Continue)
    }
}

/// Run one callback, containing panics and errors to this unit of work.
///
/// A panic or an `Err` verdict is logged with the callback's kind and name
/// and collapses to [`Dispatch::Done`]; nothing propagates to the caller.
pub(crate) fn invoke_guarded<F>(kind: &str, who: &dyn fmt::Display, f: F) -> Dispatch
where
    F: FnOnce() -> Result<Dispatch, CallbackError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            log::error!("{kind} {who} failed: {e}");
            Dispatch::Done
        }
        Err(payload) => {
            log::error!("{kind} {who} panicked: {}", panic_message(&payload));
            Dispatch::Done
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Callbacks run outside registry locks, so poisoning can only come from a
/// panic inside the runtime itself; the protected state stays consistent.
pub(crate) fn hold<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
