//! Conversion events and the handler registry they are published through
//!
//! Each layer (remote converter, proxy) owns an [`EventHub`] typed by itself,
//! so handlers always receive the object they subscribed on as the sender.
//! Handlers run synchronously on the thread that emits the event; a
//! panicking handler is logged and does not stop the others.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::panic_message;

/// Something that happened during a converter's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterEvent {
    /// Right before the native conversion starts
    Begin { phase_count: i32 },
    Warning(String),
    Error(String),
    PhaseChanged { phase: i32, description: String },
    ProgressChanged { progress: i32, description: String },
    Finished { success: bool },
    Disposed,
}

impl ConverterEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ConverterEvent::Begin { .. } => "begin",
            ConverterEvent::Warning(_) => "warning",
            ConverterEvent::Error(_) => "error",
            ConverterEvent::PhaseChanged { .. } => "phase_changed",
            ConverterEvent::ProgressChanged { .. } => "progress_changed",
            ConverterEvent::Finished { .. } => "finished",
            ConverterEvent::Disposed => "disposed",
        }
    }
}

/// Token returned by `subscribe`, used to remove the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

pub type Handler<S> = Arc<dyn Fn(&S, &ConverterEvent) + Send + Sync>;

/// Handler registry for events sent by `S`
pub struct EventHub<S> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<S>)>>,
}

impl<S> Default for EventHub<S> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<S> fmt::Debug for EventHub<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl<S> EventHub<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&S, &ConverterEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the subscription was not found
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Call every handler with `sender` and `event`.
    ///
    /// Handlers are snapshotted first, so they may subscribe or unsubscribe
    /// from inside the callback.
    pub fn emit(&self, sender: &S, event: &ConverterEvent) {
        let handlers: Vec<Handler<S>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(sender, event))) {
                tracing::warn!(
                    event = event.kind(),
                    error = %panic_message(payload.as_ref()),
                    "Event handler panicked"
                );
            }
        }
    }
}
