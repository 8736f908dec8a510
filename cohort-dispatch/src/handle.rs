use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
/// Why a handle was cancelled rather than completed.
pub enum CancelReason {
    /// The caller cancelled the handle.
    Explicit,
    /// No reply arrived before the request deadline.
    Timeout,
    /// The target has nothing registered which could handle the command.
    NoSuchService,
    /// The target is suspected to have failed or cannot be reached.
    Suspected,
    /// The target is no longer part of the membership.
    MemberLeft,
    /// The dispatcher was closed.
    Closed,
    /// The request was abandoned, for example because the group
    /// broadcast it was part of failed.
    Aborted,
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CancelReason::Explicit => "cancelled by caller",
            CancelReason::Timeout => "request deadline elapsed",
            CancelReason::NoSuchService => "no such service on the target member",
            CancelReason::Suspected => "target member is suspected",
            CancelReason::MemberLeft => "target member left the group",
            CancelReason::Closed => "dispatcher closed",
            CancelReason::Aborted => "request aborted",
        };
        write!(f, "{reason}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The state of a [ResultHandle].
pub enum HandleState {
    Pending,
    Completed,
    Cancelled(CancelReason),
}

impl HandleState {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// The ways a dispatched command can fail after it has been issued.
pub enum ExecutionError<E> {
    #[error("The request was cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("The command failed to execute")]
    /// The command itself returned an error.
    Command(E),

    #[error("The reply could not be decoded: {0}")]
    InvalidReply(String),
}

impl<E> ExecutionError<E> {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

type Callback = Box<dyn FnOnce(HandleState) + Send + 'static>;

struct Slot<T, E> {
    state: Mutex<SlotState<T, E>>,
}

struct SlotState<T, E> {
    state: HandleState,
    value: Option<Result<T, ExecutionError<E>>>,
    waker: Option<Waker>,
    callbacks: Vec<Callback>,
}

impl<T, E> Slot<T, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                state: HandleState::Pending,
                value: None,
                waker: None,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Moves the slot out of the pending state.
    ///
    /// Returns `false` if the slot was already done, in which case the
    /// provided value is discarded.
    fn finish(&self, state: HandleState, value: Result<T, ExecutionError<E>>) -> bool {
        let (waker, callbacks) = {
            let mut lock = self.state.lock();
            if !lock.state.is_pending() {
                return false;
            }

            lock.state = state;
            lock.value = Some(value);
            (lock.waker.take(), std::mem::take(&mut lock.callbacks))
        };

        if let Some(waker) = waker {
            waker.wake();
        }

        for callback in callbacks {
            callback(state);
        }

        true
    }

    fn complete(&self, result: Result<T, ExecutionError<E>>) -> bool {
        self.finish(HandleState::Completed, result)
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        self.finish(
            HandleState::Cancelled(reason),
            Err(ExecutionError::Cancelled(reason)),
        )
    }

    fn state(&self) -> HandleState {
        self.state.lock().state
    }
}

/// A one-shot, cancellable handle to the result of a dispatched command.
///
/// The handle completes exactly once, either with the command's result
/// or by being cancelled. Any later completion attempt is discarded.
pub struct ResultHandle<T, E> {
    slot: Arc<Slot<T, E>>,
}

impl<T, E> ResultHandle<T, E> {
    /// Creates a handle which is already completed.
    pub fn ready(result: Result<T, E>) -> Self {
        let slot = Slot::new();
        slot.complete(result.map_err(ExecutionError::Command));
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Creates a pending handle along with the completer used to resolve it.
    pub(crate) fn pending() -> (Completer<T, E>, Self) {
        let slot = Arc::new(Slot::new());
        let completer = Completer { slot: slot.clone() };
        (completer, Self { slot })
    }

    /// Cancels the handle if it is still pending.
    ///
    /// Returns `true` if this call cancelled the handle.
    pub fn cancel(&self) -> bool {
        self.slot.cancel(CancelReason::Explicit)
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) -> bool {
        self.slot.cancel(reason)
    }

    #[inline]
    pub fn state(&self) -> HandleState {
        self.slot.state()
    }

    #[inline]
    /// Returns if the handle has been completed or cancelled.
    pub fn is_done(&self) -> bool {
        !self.state().is_pending()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Registers a callback which is invoked once the handle is done.
    ///
    /// If the handle is already done the callback runs immediately on the
    /// calling thread, otherwise it runs on whichever thread completes the handle.
    pub(crate) fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(HandleState) + Send + 'static,
    {
        let state = {
            let mut lock = self.slot.state.lock();
            if lock.state.is_pending() {
                lock.callbacks.push(Box::new(callback));
                return;
            }
            lock.state
        };

        callback(state);
    }
}

impl<T, E> Future for ResultHandle<T, E> {
    type Output = Result<T, ExecutionError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut lock = self.slot.state.lock();

        if lock.state.is_pending() {
            lock.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        match lock.value.take() {
            Some(value) => Poll::Ready(value),
            None => panic!("ResultHandle polled after completion"),
        }
    }
}

impl<T, E> Debug for ResultHandle<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// The producer side of a [ResultHandle].
///
/// Dropping a completer which never resolved its handle aborts the handle
/// so the caller is never left waiting on a request nobody tracks anymore.
pub(crate) struct Completer<T, E> {
    slot: Arc<Slot<T, E>>,
}

impl<T, E> Completer<T, E> {
    pub(crate) fn complete(&self, result: Result<T, ExecutionError<E>>) -> bool {
        self.slot.complete(result)
    }

    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        self.slot.cancel(reason)
    }
}

impl<T, E> Drop for Completer<T, E> {
    fn drop(&mut self) {
        self.slot.cancel(CancelReason::Aborted);
    }
}
