//! Promise-style access to async replies.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::dispatcher::{run_or_dispatch, Dispatcher};
use crate::error::{Error, Result};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// The eventual reply to an async request.
///
/// Settles exactly once: with the decoded reply, or with an error if the
/// request was cancelled. Consume it with [`then`](Self::then),
/// [`when_settled`](Self::when_settled), or by awaiting it.
pub struct ReplyPromise<T> {
    shared: Arc<Mutex<State<T>>>,
}

/// The write side of a [`ReplyPromise`].
pub(crate) struct ReplyResolver<T> {
    shared: Arc<Mutex<State<T>>>,
}

enum State<T> {
    Pending {
        callback: Option<Callback<T>>,
        waker: Option<Waker>,
    },
    Settled(Result<T>),
    Consumed,
}

impl<T: Send + 'static> ReplyPromise<T> {
    pub(crate) fn new() -> (Self, ReplyResolver<T>) {
        let shared = Arc::new(Mutex::new(State::Pending {
            callback: None,
            waker: None,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ReplyResolver { shared },
        )
    }

    /// A promise that is already settled.
    pub fn settled(result: Result<T>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State::Settled(result))),
        }
    }

    /// Run `on_ok` or `on_err` on `dispatcher` once settled.
    pub fn then<F, E>(self, dispatcher: Arc<dyn Dispatcher>, on_ok: F, on_err: E)
    where
        F: FnOnce(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.when_settled(dispatcher, move |result| match result {
            Ok(value) => on_ok(value),
            Err(err) => on_err(err),
        });
    }

    /// Run `callback` with the result on `dispatcher` once settled.
    ///
    /// The callback runs inline when the promise settles on the
    /// dispatcher's own thread, which keeps replies in arrival order.
    pub fn when_settled<F>(self, dispatcher: Arc<dyn Dispatcher>, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let deliver: Callback<T> = Box::new(move |result| {
            run_or_dispatch(&dispatcher, move || callback(result));
        });

        let mut state = lock(&self.shared);
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Settled(result) => {
                drop(state);
                deliver(result);
            }
            State::Pending { .. } => {
                *state = State::Pending {
                    callback: Some(deliver),
                    waker: None,
                };
            }
            State::Consumed => {}
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(*lock(&self.shared), State::Settled(_))
    }
}

impl<T> ReplyResolver<T> {
    pub(crate) fn settle(self, result: Result<T>) {
        let mut state = lock(&self.shared);
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Pending {
                callback: Some(callback),
                ..
            } => {
                drop(state);
                callback(result);
            }
            State::Pending {
                callback: None,
                waker,
            } => {
                *state = State::Settled(result);
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            // Settled twice; keep the first result.
            previous => *state = previous,
        }
    }
}

impl<T> Future for ReplyPromise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared);
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Settled(result) => Poll::Ready(result),
            State::Pending { callback, .. } => {
                *state = State::Pending {
                    callback,
                    waker: Some(cx.waker().clone()),
                };
                Poll::Pending
            }
            State::Consumed => Poll::Ready(Err(Error::InvalidConnection)),
        }
    }
}

impl<T> fmt::Debug for ReplyPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *lock(&self.shared) {
            State::Pending { .. } => "pending",
            State::Settled(_) => "settled",
            State::Consumed => "consumed",
        };
        f.debug_struct("ReplyPromise").field("state", &state).finish()
    }
}

fn lock<T>(shared: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
