//! Dispatch thread discipline.
//!
//! All channel state transitions and completion handlers execute on one
//! serialized dispatch context: a dedicated thread draining a task queue.
//! Code on any other thread marshals work in via [`Dispatcher::invoke_later`]
//! or [`Dispatcher::invoke_and_wait`]; no two state transitions ever race
//! because both run on this queue.

use crate::error::Error;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The serialized dispatch context.
///
/// Cheap to share behind an `Arc`; dropped or shut down explicitly, the
/// queue is closed and the dispatch thread joined.
pub struct Dispatcher {
    tx: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the dispatch thread.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let worker = thread::spawn(move || Self::run(&rx));
        let thread_id = worker.thread().id();
        Self { tx: Mutex::new(Some(tx)), thread_id, worker: Mutex::new(Some(worker)) }
    }

    fn run(rx: &Receiver<Task>) {
        // The iterator ends only once the queue is closed AND empty, so a
        // task whose submission raced the shutdown still runs.
        for task in rx.iter() {
            // A panicking task must not take down the whole protocol
            // state; log it and keep draining the queue.
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("dispatch task panicked");
            }
        }
    }

    /// Whether the calling thread is the dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueue a task for execution on the dispatch thread and return
    /// immediately.
    pub fn invoke_later<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                tx.send(Box::new(task)).map_err(|_| Error::DispatcherShutDown)
            }
            None => Err(Error::DispatcherShutDown),
        }
    }

    /// Run a task on the dispatch thread and block until it has completed,
    /// returning its value.
    ///
    /// Called from the dispatch thread itself, the task runs synchronously
    /// in place; blocking on the queue there would deadlock.
    pub fn invoke_and_wait<T, F>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Ok(task());
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.invoke_later(move || {
            let _ = done_tx.send(task());
        })?;
        done_rx.recv().map_err(|_| Error::DispatcherShutDown)
    }

    /// Close the queue and join the dispatch thread.
    ///
    /// Every task that was accepted still runs before the thread exits;
    /// tasks submitted afterwards get [`Error::DispatcherShutDown`].
    pub fn shutdown(&self) {
        // Dropping the only sender closes the queue; the run loop drains
        // what remains and terminates.
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if !self.is_dispatch_thread() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_invoke_later_runs_on_dispatch_thread() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let d = dispatcher.clone();
        dispatcher
            .invoke_later(move || {
                let _ = tx.send(d.is_dispatch_thread());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!dispatcher.is_dispatch_thread());
    }

    #[test]
    fn test_invoke_and_wait_returns_value() {
        let dispatcher = Dispatcher::new();
        let value = dispatcher.invoke_and_wait(|| 6 * 7).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_invoke_and_wait_from_dispatch_thread_runs_inline() {
        let dispatcher = Arc::new(Dispatcher::new());
        let d = dispatcher.clone();
        // A nested invoke_and_wait on the dispatch thread must short-circuit
        // to synchronous execution instead of deadlocking on its own queue.
        let value = dispatcher
            .invoke_and_wait(move || d.invoke_and_wait(|| 7).unwrap())
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_tasks_run_in_order() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let counter = counter.clone();
            dispatcher
                .invoke_later(move || {
                    // Each task sees exactly the predecessors' count.
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                })
                .unwrap();
        }
        dispatcher.invoke_and_wait(|| ()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_accepted_tasks_run_even_when_shutdown_races_submission() {
        let dispatcher = Arc::new(Dispatcher::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));
        let d = dispatcher.clone();
        let acc = accepted.clone();
        let exec = executed.clone();
        let submitter = thread::spawn(move || {
            for _ in 0..1000 {
                let exec = exec.clone();
                let submitted = d.invoke_later(move || {
                    exec.fetch_add(1, Ordering::SeqCst);
                });
                if submitted.is_ok() {
                    acc.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        thread::sleep(Duration::from_millis(2));
        dispatcher.shutdown();
        submitter.join().unwrap();
        // No accepted submission may be silently dropped by the shutdown.
        assert_eq!(executed.load(Ordering::SeqCst), accepted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let dispatcher = Dispatcher::new();
        dispatcher.shutdown();
        let result = dispatcher.invoke_later(|| ());
        assert!(matches!(result, Err(Error::DispatcherShutDown)));
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_queue() {
        let dispatcher = Dispatcher::new();
        dispatcher.invoke_later(|| panic!("deliberate")).unwrap();
        let value = dispatcher.invoke_and_wait(|| 1).unwrap();
        assert_eq!(value, 1);
    }
}
