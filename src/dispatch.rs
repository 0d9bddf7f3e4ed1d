//! Execution Confinement Dispatcher
//!
//! wkhtmltox is neither thread-safe nor re-entrant, and Qt additionally
//! expects every call to come from the thread that initialized it. The
//! dispatcher owns one dedicated worker thread and runs every submitted
//! closure there, one at a time, in enqueue order.
//!
//! # Design
//!
//! ```text
//! ┌──────────────┐   submit()    ┌──────────────────────────┐
//! │ client thread│ ────────────► │ Mutex<VecDeque<Job>>     │
//! │   (blocked)  │               │ + Condvar (many → one)   │
//! └──────▲───────┘               └────────────┬─────────────┘
//!        │                                    │ pop_front()
//!        │     TaskSlot (Mutex + Condvar)     ▼
//!        └──────────────────────────── worker thread runs Job
//! ```
//!
//! # Limitations
//!
//! There is no timeout or cancellation. A native call that never returns
//! blocks the worker, and with it every later submission against the same
//! dispatcher.
//!
//! Every job catches its own panic, so the loop itself only dies on a fault
//! outside a job. That path is logged at critical severity and leaves the
//! dispatcher terminated.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Sequence used to name worker threads
static THREAD_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher has been terminated")]
    Terminated,
    #[error("task was dropped before it could run")]
    Abandoned,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(String),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Job>,
    // Run on the worker after the loop exits
    finalizers: Vec<Job>,
    shutdown: bool,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Result slot shared between the submitting thread and the worker
struct TaskSlot<R> {
    value: Mutex<Option<Result<R, DispatchError>>>,
    done: Condvar,
}

impl<R> TaskSlot<R> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Result<R, DispatchError>) {
        let mut value = self.value.lock();
        if value.is_none() {
            *value = Some(outcome);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> Result<R, DispatchError> {
        let mut value = self.value.lock();
        loop {
            if let Some(outcome) = value.take() {
                return outcome;
            }
            self.done.wait(&mut value);
        }
    }
}

/// Fills the slot exactly once; a job dropped unrun reports `Abandoned`.
struct Completer<R> {
    slot: Option<Arc<TaskSlot<R>>>,
}

impl<R> Completer<R> {
    fn finish(mut self, outcome: Result<R, DispatchError>) {
        if let Some(slot) = self.slot.take() {
            slot.complete(outcome);
        }
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.complete(Err(DispatchError::Abandoned));
        }
    }
}

/// Single worker thread that serializes submitted closures
pub struct Dispatcher {
    shared: Arc<Shared>,
    name: String,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start a new worker thread named `<name>-<sequence>`
    pub fn spawn(name: &str) -> Result<Self, DispatchError> {
        let name = format!("{}-{}", name, THREAD_SEQ.fetch_add(1, Ordering::Relaxed));

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                finalizers: Vec::new(),
                shutdown: false,
                stopped: false,
            }),
            available: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker_shared, worker_name))
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let thread_id = handle.thread().id();
        tracing::debug!(thread = %name, "Started dispatcher thread");

        Ok(Self {
            shared,
            name,
            thread_id,
            handle: Some(handle),
        })
    }

    /// Run `task` on the worker thread and block until it has finished.
    ///
    /// Calling this from the worker thread itself deadlocks; check
    /// [`Dispatcher::is_current_thread`] first.
    pub fn submit<F, R>(&self, task: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = Arc::new(TaskSlot::new());
        let completer = Completer {
            slot: Some(Arc::clone(&slot)),
        };

        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| DispatchError::TaskPanicked(panic_message(payload.as_ref())));
            completer.finish(outcome);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(DispatchError::Terminated);
            }
            queue.tasks.push_back(job);
            self.shared.available.notify_one();
        }

        slot.wait()
    }

    /// Whether the caller is running on this dispatcher's worker thread
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Identifier of the worker thread
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Worker thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Whether the worker has stopped accepting tasks
    pub fn is_terminated(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Ask the worker to exit once the current task (if any) completes.
    ///
    /// Tasks still queued are dropped and their submitters receive
    /// [`DispatchError::Abandoned`].
    pub fn terminate(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        self.shared.available.notify_all();
    }

    /// Terminate, then run `task` on the worker once the current task (if
    /// any) has returned.
    ///
    /// Does not wait, so the worker may call this on itself. Fails with
    /// [`DispatchError::Terminated`] if the worker has already exited, in
    /// which case `task` is dropped unrun.
    pub fn close_with<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return Err(DispatchError::Terminated);
        }
        queue.finalizers.push(Box::new(task));
        queue.shutdown = true;
        self.shared.available.notify_all();
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();

        if let Some(handle) = self.handle.take() {
            // A worker cannot join itself; it exits on its own after this task.
            if self.is_current_thread() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(thread = %self.name, "Dispatcher thread exited abnormally");
            }
        }
    }
}

fn run(shared: Arc<Shared>, name: String) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| serve(&shared)));

    let (orphaned, finalizers) = {
        let mut queue = shared.queue.lock();
        queue.shutdown = true;
        queue.stopped = true;
        (
            std::mem::take(&mut queue.tasks),
            std::mem::take(&mut queue.finalizers),
        )
    };

    if let Err(payload) = outcome {
        tracing::error!(
            severity = "critical",
            thread = %name,
            error = %panic_message(payload.as_ref()),
            "Exception in dispatcher thread; no further tasks will run"
        );
    }

    if !orphaned.is_empty() {
        tracing::debug!(thread = %name, count = orphaned.len(), "Abandoning queued tasks");
    }
    drop(orphaned);

    for finalizer in finalizers {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(finalizer)) {
            tracing::warn!(
                thread = %name,
                error = %panic_message(payload.as_ref()),
                "Dispatcher finalizer panicked"
            );
        }
    }

    tracing::debug!(thread = %name, "Dispatcher thread stopped");
}

fn serve(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(job) = queue.tasks.pop_front() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };

        job();
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
