//! Client-facing converter
//!
//! [`PdfConverter`] is what callers hold. Every operation is packaged as a
//! closure and run through the isolation context, so the remote
//! [`Converter`] only ever sees calls on the thread allowed to touch the
//! native library. Remote events are re-published with the proxy itself as
//! the sender.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::converter::{Content, Converter, ConverterId};
use crate::error::{Error, Result};
use crate::events::{ConverterEvent, EventHub, SubscriptionId};
use crate::isolation::{IsolationContext, ManagerInner};
use crate::settings::{GlobalSettings, ObjectSettings};

struct ProxyInner {
    id: ConverterId,
    remote: Arc<Converter>,
    relay: SubscriptionId,
    context: Arc<IsolationContext>,
    manager: Arc<ManagerInner>,
    disposed: AtomicBool,
    events: EventHub<PdfConverter>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(converter = %self.id, "Converter dropped without dispose");

        self.remote.unsubscribe(self.relay);
        if !self.remote.is_disposed() && !self.context.is_closed() {
            let remote = Arc::clone(&self.remote);
            if let Err(e) = self.context.invoke(move || remote.dispose()) {
                tracing::warn!(converter = %self.id, error = %e, "Failed to release converter on drop");
            }
        }
        self.manager.release(&self.context);
    }
}

/// Thread-safe handle to a converter living in an isolation context
///
/// Clones share the same converter. Dropping the last clone of a converter
/// that was never disposed releases it.
#[derive(Clone)]
pub struct PdfConverter {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for PdfConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfConverter")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote.id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PdfConverter {
    /// Build the remote converter inside `context` and wrap it.
    ///
    /// The caller has already registered this converter with the manager.
    pub(crate) fn new(
        manager: Arc<ManagerInner>,
        context: Arc<IsolationContext>,
        settings: GlobalSettings,
    ) -> Result<Self> {
        let target = Arc::clone(&context);
        let remote = context.invoke(move || {
            let library = target.library()?;
            let converter = Converter::new(&library, settings);
            target.register(&converter);
            Ok(converter)
        })?;

        let inner = Arc::new_cyclic(|proxy: &Weak<ProxyInner>| {
            let proxy = proxy.clone();
            let relay = remote.subscribe(move |_, event| {
                if *event == ConverterEvent::Disposed {
                    return;
                }
                if let Some(inner) = proxy.upgrade() {
                    let sender = PdfConverter { inner };
                    sender.inner.events.emit(&sender, event);
                }
            });

            ProxyInner {
                id: ConverterId::next(),
                remote,
                relay,
                context,
                manager,
                disposed: AtomicBool::new(false),
                events: EventHub::new(),
            }
        });

        tracing::debug!(
            converter = %inner.id,
            remote = %inner.remote.id(),
            context = inner.context.id(),
            "Converter proxy created"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConverterId {
        self.inner.id
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire) || self.inner.remote.is_disposed()
    }

    fn verify_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Run `f` against the remote converter inside the isolation context
    fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Arc<Converter>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.verify_not_disposed()?;
        let remote = Arc::clone(&self.inner.remote);
        self.inner.context.invoke(move || f(&remote))
    }

    /// Convert `content` with the given object settings.
    ///
    /// Returns `Ok(None)` when the library reports failure.
    pub fn convert_with(&self, object: &ObjectSettings, content: impl Into<Content>) -> Result<Option<Vec<u8>>> {
        let object = object.clone();
        let content = content.into();
        self.call(move |remote| remote.convert(&object, content))
    }

    /// Convert whatever the object's `page` setting points at
    pub fn convert_object(&self, object: &ObjectSettings) -> Result<Option<Vec<u8>>> {
        self.convert_with(object, Content::FromPage)
    }

    pub fn convert_html(&self, html: &str) -> Result<Option<Vec<u8>>> {
        self.convert_with(&ObjectSettings::default(), html)
    }

    pub fn convert_bytes(&self, html: &[u8]) -> Result<Option<Vec<u8>>> {
        self.convert_with(&ObjectSettings::default(), html)
    }

    /// Convert a URL or local file name
    pub fn convert_uri(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        self.convert_object(&ObjectSettings::for_page(uri))
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, &ConverterEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Fired right before native conversion, with the number of phases
    pub fn on_begin<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, i32) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::Begin { phase_count } = event {
                handler(sender, *phase_count);
            }
        })
    }

    pub fn on_warning<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, &str) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::Warning(message) = event {
                handler(sender, message);
            }
        })
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, &str) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::Error(message) = event {
                handler(sender, message);
            }
        })
    }

    pub fn on_phase_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, i32, &str) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::PhaseChanged { phase, description } = event {
                handler(sender, *phase, description);
            }
        })
    }

    pub fn on_progress_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, i32, &str) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::ProgressChanged { progress, description } = event {
                handler(sender, *progress, description);
            }
        })
    }

    pub fn on_finished<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter, bool) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ConverterEvent::Finished { success } = event {
                handler(sender, *success);
            }
        })
    }

    pub fn on_disposed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PdfConverter) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if *event == ConverterEvent::Disposed {
                handler(sender);
            }
        })
    }

    pub fn current_phase(&self) -> Result<i32> {
        self.call(|remote| remote.current_phase())
    }

    pub fn phase_count(&self) -> Result<i32> {
        self.call(|remote| remote.phase_count())
    }

    pub fn phase_description(&self, phase: i32) -> Result<String> {
        self.call(move |remote| remote.phase_description(phase))
    }

    pub fn progress_string(&self) -> Result<String> {
        self.call(|remote| remote.progress_string())
    }

    pub fn http_error_code(&self) -> Result<i32> {
        self.call(|remote| remote.http_error_code())
    }

    /// Read a global setting back from the last conversion
    pub fn global_setting(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.call(move |remote| remote.global_setting(&name))
    }

    pub fn object_setting(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.call(move |remote| remote.object_setting(&name))
    }

    /// Release the converter and fire `Disposed`. Idempotent.
    ///
    /// Fails with [`Error::Busy`] while a conversion on this converter runs.
    pub fn dispose(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Ok(());
        }

        if !inner.remote.is_disposed() && !inner.context.is_closed() {
            let remote = Arc::clone(&inner.remote);
            match inner.context.invoke(move || remote.dispose()) {
                Ok(()) | Err(Error::ContextClosed) => {}
                Err(e) => return Err(e),
            }
        }

        if inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.remote.unsubscribe(inner.relay);

        tracing::debug!(converter = %inner.id, "Converter proxy disposed");
        inner.events.emit(self, &ConverterEvent::Disposed);
        inner.manager.release(&inner.context);
        Ok(())
    }
}
