//! Single-resolution deferred value and its read-only promise view.
//!
//! A [`Deferred`] is resolved or rejected exactly once. The `PENDING ->
//! RESOLVING` compare-and-set on `state` is the only thing deciding which
//! caller wins; the loser gets [`DeferredError::AlreadyResolved`] and the
//! stored outcome is left untouched.
//!
//! A [`Promise`] accepts one callback registration. The registered callback
//! runs exactly once whether it is attached before, after, or concurrently
//! with resolution: both sides publish (outcome or callbacks) and then look
//! for the other, and the `delivered` compare-and-set picks a single
//! deliverer. No locks are taken on either path.
//!
//! Independently of callbacks, a promise is a [`Future`] for `T: Clone,
//! E: Clone`, woken through an [`AtomicWaker`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::error::DeferredError;

const PENDING: u8 = 0;
const RESOLVING: u8 = 1;
const DONE: u8 = 2;
const REJECTED: u8 = 3;

type DoneCallback<T> = Box<dyn FnOnce(&T) + Send>;
type FailCallback<E> = Box<dyn FnOnce(&E) + Send>;

struct Callbacks<T, E> {
    done: Option<DoneCallback<T>>,
    fail: Option<FailCallback<E>>,
}

struct Shared<T, E> {
    state: AtomicU8,
    outcome: OnceLock<Result<T, E>>,
    attached: AtomicBool,
    callbacks: AtomicPtr<Callbacks<T, E>>,
    delivered: AtomicBool,
    waker: AtomicWaker,
}

impl<T, E> Shared<T, E> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            outcome: OnceLock::new(),
            attached: AtomicBool::new(false),
            callbacks: AtomicPtr::new(ptr::null_mut()),
            delivered: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<(), DeferredError> {
        if self
            .state
            .compare_exchange(PENDING, RESOLVING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeferredError::AlreadyResolved);
        }

        let terminal = if outcome.is_ok() { DONE } else { REJECTED };
        // Only the compare-and-set winner gets here, so the cell is empty.
        let _ = self.outcome.set(outcome);
        self.state.store(terminal, Ordering::SeqCst);

        self.waker.wake();
        self.deliver();
        Ok(())
    }

    fn outcome(&self) -> Option<&Result<T, E>> {
        if self.state.load(Ordering::SeqCst) >= DONE {
            self.outcome.get()
        } else {
            None
        }
    }

    fn attach(&self, callbacks: Callbacks<T, E>) -> Result<(), DeferredError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(DeferredError::CallbackAlreadyAttached);
        }

        let raw = Box::into_raw(Box::new(callbacks));
        self.callbacks.store(raw, Ordering::SeqCst);
        self.deliver();
        Ok(())
    }

    fn deliver(&self) {
        let Some(outcome) = self.outcome() else {
            return;
        };
        if self.callbacks.load(Ordering::SeqCst).is_null() {
            return;
        }
        if self
            .delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let raw = self.callbacks.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return;
        }
        // SAFETY: `raw` came from `Box::into_raw` in `attach`. The `delivered`
        // flag lets exactly one thread reach this swap, and the swap leaves a
        // null pointer behind, so neither a second delivery nor `Drop` can
        // reclaim the same allocation.
        let callbacks = unsafe { Box::from_raw(raw) };
        match outcome {
            Ok(value) => {
                if let Some(done) = callbacks.done {
                    done(value);
                }
            }
            Err(cause) => {
                if let Some(fail) = callbacks.fail {
                    fail(cause);
                }
            }
        }
    }
}

impl<T, E> Drop for Shared<T, E> {
    fn drop(&mut self) {
        let raw = *self.callbacks.get_mut();
        if !raw.is_null() {
            // SAFETY: we hold `&mut self`, so no deliverer can race us, and a
            // non-null pointer is still owned by this cell.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

/// The resolving side of a single-resolution value.
pub struct Deferred<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Deferred<T, E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Resolve with a value.
    ///
    /// Fails with [`DeferredError::AlreadyResolved`] if this deferred was
    /// already resolved or rejected; the first outcome is kept.
    #[must_use = "a failed resolve means the deferred was completed twice"]
    pub fn resolve(&self, value: T) -> Result<(), DeferredError> {
        self.shared.settle(Ok(value))
    }

    /// Reject with a failure cause. Same exclusivity as [`Deferred::resolve`].
    #[must_use = "a failed reject means the deferred was completed twice"]
    pub fn reject(&self, cause: E) -> Result<(), DeferredError> {
        self.shared.settle(Err(cause))
    }

    /// A read-only view for attaching callbacks or awaiting.
    pub fn promise(&self) -> Promise<T, E> {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> PromiseState {
        state_of(&self.shared)
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != PromiseState::Pending
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only view of a [`Deferred`].
///
/// Awaiting is meant for a single task at a time: the waker slot holds one
/// waker, so concurrent awaits of several views of the same deferred may
/// starve all but the last registered one.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Promise<T, E> {
    /// Register success and failure callbacks.
    ///
    /// If the promise is already resolved the matching callback runs inline
    /// on the calling thread; otherwise it runs on the resolving thread.
    #[must_use = "attaching twice is an error"]
    pub fn then<D, F>(&self, done: D, fail: F) -> Result<(), DeferredError>
    where
        D: FnOnce(&T) + Send + 'static,
        F: FnOnce(&E) + Send + 'static,
    {
        self.shared.attach(Callbacks {
            done: Some(Box::new(done)),
            fail: Some(Box::new(fail)),
        })
    }

    /// Register only a success callback. A rejection is then not reported.
    #[must_use = "attaching twice is an error"]
    pub fn done<D>(&self, done: D) -> Result<(), DeferredError>
    where
        D: FnOnce(&T) + Send + 'static,
    {
        self.shared.attach(Callbacks {
            done: Some(Box::new(done)),
            fail: None,
        })
    }

    /// Register only a failure callback.
    #[must_use = "attaching twice is an error"]
    pub fn fail<F>(&self, fail: F) -> Result<(), DeferredError>
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.shared.attach(Callbacks {
            done: None,
            fail: Some(Box::new(fail)),
        })
    }

    /// Peek at the outcome without waiting.
    pub fn outcome(&self) -> Option<&Result<T, E>> {
        self.shared.outcome()
    }

    pub fn state(&self) -> PromiseState {
        state_of(&self.shared)
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != PromiseState::Pending
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.shared.outcome() {
            return Poll::Ready(outcome.clone());
        }
        self.shared.waker.register(cx.waker());
        match self.shared.outcome() {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => Poll::Pending,
        }
    }
}

fn state_of<T, E>(shared: &Shared<T, E>) -> PromiseState {
    match shared.state.load(Ordering::SeqCst) {
        DONE => PromiseState::Resolved,
        REJECTED => PromiseState::Rejected,
        _ => PromiseState::Pending,
    }
}
