//! Asynchronous callback collector.
//!
//! A fan-in join primitive: a caller registers N pending sub-operations,
//! marks registration finished, and receives exactly one aggregated
//! completion callback once every sub-operation has resolved. The two-phase
//! gate (all handles done AND initialization complete) closes the race where
//! the last sub-operation finishes before the caller has registered the rest.

use crate::dispatch::Dispatcher;
use crate::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Decides which thread runs a completion callback.
pub trait InvocationDelegate: Send + Sync {
    /// Run `task` on the delegate's execution context.
    fn invoke(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs the callback inline on whatever thread completed last.
pub struct CallingThread;

impl InvocationDelegate for CallingThread {
    fn invoke(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Marshals the callback onto the dispatch thread.
pub struct DispatchThread(pub Arc<Dispatcher>);

impl InvocationDelegate for DispatchThread {
    fn invoke(&self, task: Box<dyn FnOnce() + Send>) {
        if self.0.invoke_later(task).is_err() {
            log::warn!("completion callback dropped: dispatcher has shut down");
        }
    }
}

/// Aggregated failure of a collector: the first error encountered, with any
/// later ones attached as detail.
#[derive(Debug, Clone)]
pub struct AggregateError {
    /// The first error reported by any handle.
    pub first: Error,
    /// Errors reported after the first; never silently dropped.
    pub others: Vec<Error>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.others.is_empty() {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{} (and {} more)", self.first, self.others.len())
        }
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.first)
    }
}

type FinalCallback = Box<dyn FnOnce(Result<(), AggregateError>) + Send>;

struct CollectorState {
    pending: usize,
    init_complete: bool,
    fired: bool,
    first_error: Option<Error>,
    other_errors: Vec<Error>,
    on_done: Option<FinalCallback>,
}

struct CollectorInner {
    state: Mutex<CollectorState>,
    delegate: Arc<dyn InvocationDelegate>,
}

impl CollectorInner {
    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_fire(&self) {
        let callback;
        let result;
        {
            let mut state = self.lock();
            if state.fired || !state.init_complete || state.pending > 0 {
                return;
            }
            state.fired = true;
            let Some(on_done) = state.on_done.take() else { return };
            callback = on_done;
            result = match state.first_error.take() {
                Some(first) => {
                    Err(AggregateError { first, others: std::mem::take(&mut state.other_errors) })
                }
                None => Ok(()),
            };
        }
        self.delegate.invoke(Box::new(move || callback(result)));
    }

    fn handle_done(&self, result: Result<(), Error>) {
        {
            let mut state = self.lock();
            state.pending -= 1;
            if let Err(e) = result {
                // First error wins; the rest become detail.
                if state.first_error.is_none() {
                    state.first_error = Some(e);
                } else {
                    state.other_errors.push(e);
                }
            }
        }
        self.maybe_fire();
    }
}

/// Joins N asynchronous sub-operations into one final callback.
pub struct CallbackCollector {
    inner: Arc<CollectorInner>,
}

impl CallbackCollector {
    /// Create a collector. `on_done` fires exactly once, through `delegate`,
    /// after [`CallbackCollector::initialization_complete`] has been called
    /// and every handle has resolved.
    pub fn new(
        on_done: impl FnOnce(Result<(), AggregateError>) + Send + 'static,
        delegate: Arc<dyn InvocationDelegate>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                state: Mutex::new(CollectorState {
                    pending: 0,
                    init_complete: false,
                    fired: false,
                    first_error: None,
                    other_errors: Vec::new(),
                    on_done: Some(Box::new(on_done)),
                }),
                delegate,
            }),
        }
    }

    /// Register one more pending sub-operation and return its handle.
    ///
    /// Must not be called after `initialization_complete()`; a late
    /// registration is still counted, but logged as a contract violation.
    pub fn new_handle(&self) -> CollectorHandle {
        let mut state = self.inner.lock();
        if state.init_complete {
            log::warn!("collector handle requested after initialization was marked complete");
        }
        state.pending += 1;
        drop(state);
        CollectorHandle { inner: self.inner.clone() }
    }

    /// Signal that no more handles will be registered. The final callback
    /// cannot fire before this, no matter how fast the sub-operations are.
    pub fn initialization_complete(&self) {
        self.inner.lock().init_complete = true;
        self.inner.maybe_fire();
    }
}

/// One pending sub-operation of a [`CallbackCollector`].
///
/// Consumed by [`CollectorHandle::done`]; the move makes a double completion
/// unrepresentable.
pub struct CollectorHandle {
    inner: Arc<CollectorInner>,
}

impl CollectorHandle {
    /// Mark this sub-operation finished.
    pub fn done(self, result: Result<(), Error>) {
        self.inner.handle_done(result);
    }

    /// Shorthand for a successful completion.
    pub fn done_ok(self) {
        self.done(Ok(()));
    }
}
