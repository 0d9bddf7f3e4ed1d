//! Isolation Lifecycle Manager
//!
//! An [`IsolationContext`] is one loaded instance of wkhtmltox together with
//! the dispatcher that confines calls into it. The [`IsolationManager`] owns
//! the runtime toggles, creates the context lazily, counts the converters
//! living in it and tears it down again.
//!
//! # Lifecycle
//!
//! ```text
//!   ensure_ready / create            last release (dynamic loading)
//!  ──────────────────────► Loaded ─────────────────────────────────► Unloaded
//!   spawn dispatcher        │  ▲        dispose survivors, deinit,       │
//!   load + init on worker   │  │        drop module, stop worker,        │
//!                           ▼  │        unlink until released           │
//!                        create/release                                  │
//!  ◄─────────────────────────────────────────────────────────────────────┘
//!                     next ensure_ready loads a fresh instance
//! ```
//!
//! Teardown reached from inside an event handler closes the context at once
//! but defers disposal and `deinit` until the running conversion returns. In
//! synchronized mode that work runs as the worker's last job; the worker
//! cannot join itself, so the module is left mapped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::config::RuntimeConfig;
use crate::converter::Converter;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::native::{LibraryLoader, NativeLibrary, SharedObjectLoader};
use crate::proxy::PdfConverter;
use crate::settings::GlobalSettings;

/// Upper bound on unlink attempts after a teardown
const UNLINK_LIMIT: usize = 64;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// One loaded instance of the native library
pub struct IsolationContext {
    id: u64,
    synchronized: bool,
    library_path: PathBuf,
    loader: Arc<dyn LibraryLoader>,
    library: Mutex<Option<Arc<dyn NativeLibrary>>>,
    dispatcher: RwLock<Option<Dispatcher>>,
    // Serializes native calls when there is no dispatcher
    gate: ReentrantMutex<()>,
    // Nesting of `execute` calls holding the gate
    depth: AtomicUsize,
    // Teardown waiting for the outermost gate holder to return
    deferred: Mutex<Option<Deferred>>,
    closed: AtomicBool,
    live: AtomicUsize,
    converters: Mutex<Vec<Weak<Converter>>>,
}

impl fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.id)
            .field("synchronized", &self.synchronized)
            .field("closed", &self.is_closed())
            .field("live", &self.live())
            .finish()
    }
}

impl IsolationContext {
    /// Spawn the worker (if synchronized), then load and initialize the
    /// library on it
    fn start(config: &RuntimeConfig, loader: Arc<dyn LibraryLoader>) -> Result<Self> {
        let dispatcher = if config.synchronized {
            Some(Dispatcher::spawn("wkbridge-dispatch")?)
        } else {
            None
        };

        let context = IsolationContext {
            id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            synchronized: config.synchronized,
            library_path: config.library_path.clone(),
            loader,
            library: Mutex::new(None),
            dispatcher: RwLock::new(dispatcher),
            gate: ReentrantMutex::new(()),
            depth: AtomicUsize::new(0),
            deferred: Mutex::new(None),
            closed: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            converters: Mutex::new(Vec::new()),
        };

        let loader = Arc::clone(&context.loader);
        let path = context.library_path.clone();
        let use_graphics = config.use_graphics;
        let (library, version) = context.execute(move || {
            let library = loader.load(&path)?;
            if !library.init(use_graphics) {
                return Err(Error::Native("wkhtmltopdf_init failed".to_string()));
            }
            let version = library.version();
            Ok((library, version))
        })?;

        tracing::info!(
            context = context.id,
            synchronized = context.synchronized,
            use_graphics,
            path = %context.library_path.display(),
            %version,
            "Isolation context loaded"
        );

        *context.library.lock() = Some(library);
        Ok(context)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Live converters registered in this context
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Worker thread, in synchronized mode
    pub fn worker_thread(&self) -> Option<ThreadId> {
        self.dispatcher.read_recursive().as_ref().map(Dispatcher::thread_id)
    }

    pub(crate) fn library(&self) -> Result<Arc<dyn NativeLibrary>> {
        self.library.lock().clone().ok_or(Error::ContextClosed)
    }

    /// Run `f` where native calls are allowed.
    ///
    /// In synchronized mode that is the worker thread; a caller already on
    /// the worker runs inline. Without a dispatcher `f` runs on the caller's
    /// thread under the context's call gate.
    pub(crate) fn invoke<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        self.execute(f)
    }

    fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let dispatcher = self.dispatcher.read_recursive();
        match dispatcher.as_ref() {
            Some(dispatcher) if !dispatcher.is_current_thread() => {
                dispatcher.submit(f).map_err(|e| {
                    if self.is_closed() {
                        Error::ContextClosed
                    } else {
                        Error::from(e)
                    }
                })?
            }
            None if self.synchronized => Err(Error::ContextClosed),
            _ => {
                let _gate = self.gate.lock();
                let result = {
                    let _depth = GateDepth::enter(&self.depth);
                    f()
                };
                if self.depth.load(Ordering::Acquire) == 0 {
                    let deferred = self.deferred.lock().take();
                    if let Some(teardown) = deferred {
                        teardown();
                    }
                }
                result
            }
        }
    }

    /// Whether this thread is already inside `execute` under the gate
    fn inside_gate(&self) -> bool {
        match self.gate.try_lock() {
            Some(_held) => self.depth.load(Ordering::Acquire) > 0,
            None => false,
        }
    }

    pub(crate) fn register(&self, converter: &Arc<Converter>) {
        let mut converters = self.converters.lock();
        converters.retain(|existing| existing.strong_count() > 0);
        converters.push(Arc::downgrade(converter));
    }

    fn acquire(&self) -> usize {
        self.live.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn release(&self) -> usize {
        match self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                tracing::warn!(context = self.id, "Converter released more often than registered");
                0
            }
        }
    }

    /// Dispose survivors, deinitialize and drop the library on the worker,
    /// stop the worker, then unlink the module. Runs at most once.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let survivors: Vec<Arc<Converter>> = self
            .converters
            .lock()
            .drain(..)
            .filter_map(|converter| converter.upgrade())
            .collect();
        let library = self.library.lock().take();
        let context = self.id;
        let release = move || release_native(context, survivors, library);

        // Reached from a handler: a conversion is still on the stack
        {
            let dispatcher = self.dispatcher.read_recursive();
            if let Some(dispatcher) = dispatcher.as_ref() {
                if dispatcher.is_current_thread() {
                    tracing::warn!(context, "Teardown requested from the worker thread; deferred, module stays mapped");
                    if let Err(e) = dispatcher.close_with(release) {
                        tracing::warn!(context, error = %e, "Deferred teardown could not be scheduled");
                    }
                    return;
                }
            }
        }
        if self.inside_gate() {
            tracing::debug!(context, "Teardown requested during a native call; deferred");
            let loader = Arc::clone(&self.loader);
            let path = self.library_path.clone();
            *self.deferred.lock() = Some(Box::new(move || {
                release();
                let released = unlink_all(loader.as_ref(), &path);
                tracing::info!(context, released, "Isolation context torn down");
            }));
            return;
        }

        if let Err(e) = self.execute(move || {
            release();
            Ok(())
        }) {
            tracing::warn!(context, error = %e, "Teardown did not run on the worker");
        }
        if let Some(dispatcher) = self.dispatcher.read_recursive().as_ref() {
            dispatcher.terminate();
        }
        drop(self.dispatcher.write().take());

        let released = unlink_all(self.loader.as_ref(), &self.library_path);
        tracing::info!(context, released, "Isolation context torn down");
    }
}

/// Tracks one level of `execute` nesting under the call gate
struct GateDepth<'a>(&'a AtomicUsize);

impl<'a> GateDepth<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        Self(depth)
    }
}

impl Drop for GateDepth<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Dispose survivors, then deinitialize and drop the library
fn release_native(context: u64, survivors: Vec<Arc<Converter>>, library: Option<Arc<dyn NativeLibrary>>) {
    for converter in survivors {
        if let Err(e) = converter.dispose() {
            tracing::warn!(context, converter = %converter.id(), error = %e, "Failed to dispose converter on teardown");
        }
    }
    if let Some(library) = library {
        if !library.deinit() {
            tracing::warn!(context, "wkhtmltopdf_deinit reported failure");
        }
        drop(library);
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unlink_all(loader: &dyn LibraryLoader, path: &Path) -> usize {
    let mut released = 0;
    while released < UNLINK_LIMIT && loader.unlink(path) {
        released += 1;
    }
    if released == UNLINK_LIMIT {
        tracing::warn!(path = %path.display(), "Module still resident after unlink limit");
    }
    released
}

pub(crate) struct ManagerInner {
    config: Mutex<RuntimeConfig>,
    // Lock order: `context` before `config`.
    context: Mutex<Option<Arc<IsolationContext>>>,
    loader: Arc<dyn LibraryLoader>,
}

impl ManagerInner {
    fn context_locked(&self, slot: &mut Option<Arc<IsolationContext>>) -> Result<Arc<IsolationContext>> {
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }
        let config = self.config.lock().clone();
        let context = Arc::new(IsolationContext::start(&config, Arc::clone(&self.loader))?);
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Register a converter in the current context, loading it if needed
    fn acquire(&self) -> Result<Arc<IsolationContext>> {
        let mut slot = self.context.lock();
        let context = self.context_locked(&mut slot)?;
        context.acquire();
        Ok(context)
    }

    /// Unregister a converter; the last one out unloads in dynamic mode
    pub(crate) fn release(&self, context: &Arc<IsolationContext>) {
        let retired = {
            let mut slot = self.context.lock();
            let remaining = context.release();
            let dynamic = self.config.lock().dynamic_loading;
            let current = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, context));
            if remaining == 0 && dynamic && current {
                slot.take()
            } else {
                None
            }
        };

        if let Some(context) = retired {
            tracing::debug!(context = context.id, "Last converter released; unloading");
            context.shutdown();
        }
    }

    fn teardown(&self) {
        let retired = self.context.lock().take();
        if let Some(context) = retired {
            context.shutdown();
        }
    }

    /// Query the library, loading a throwaway context when none is alive
    fn query<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn NativeLibrary) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (context, throwaway) = {
            let mut slot = self.context.lock();
            let throwaway = slot.is_none();
            (self.context_locked(&mut slot)?, throwaway)
        };

        let target = Arc::clone(&context);
        let result = context.invoke(move || {
            let library = target.library()?;
            Ok(f(library.as_ref()))
        });

        if throwaway {
            let retired = {
                let mut slot = self.context.lock();
                let current = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &context));
                if current && context.live() == 0 {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(retired) = retired {
                retired.shutdown();
            }
        }

        result
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owns the runtime toggles and the isolation context converters live in
///
/// Cheap to clone; clones share the same context.
#[derive(Clone)]
pub struct IsolationManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for IsolationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationManager")
            .field("config", &self.config())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Default for IsolationManager {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl IsolationManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_loader(config, Arc::new(SharedObjectLoader))
    }

    pub fn with_loader(config: RuntimeConfig, loader: Arc<dyn LibraryLoader>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config: Mutex::new(config),
                context: Mutex::new(None),
                loader,
            }),
        }
    }

    /// Process-wide manager configured from `WKBRIDGE_*` variables
    pub fn global() -> &'static IsolationManager {
        static GLOBAL: OnceLock<IsolationManager> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid runtime configuration; using defaults");
                RuntimeConfig::default()
            });
            IsolationManager::new(config)
        })
    }

    pub fn config(&self) -> RuntimeConfig {
        self.inner.config.lock().clone()
    }

    pub fn dynamic_loading(&self) -> bool {
        self.inner.config.lock().dynamic_loading
    }

    pub fn synchronized(&self) -> bool {
        self.inner.config.lock().synchronized
    }

    pub fn use_graphics(&self) -> bool {
        self.inner.config.lock().use_graphics
    }

    pub fn library_path(&self) -> PathBuf {
        self.inner.config.lock().library_path.clone()
    }

    fn update<F>(&self, setting: &'static str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let slot = self.inner.context.lock();
        let mut config = self.inner.config.lock();

        let mut next = config.clone();
        apply(&mut next);
        if next == *config {
            return Ok(());
        }
        if slot.is_some() {
            return Err(Error::ContextAlive { setting });
        }

        *config = next;
        tracing::debug!(setting, "Runtime setting changed");
        Ok(())
    }

    /// Unload the library whenever the last converter is disposed
    pub fn set_dynamic_loading(&self, enabled: bool) -> Result<()> {
        self.update("dynamic_loading", |config| config.dynamic_loading = enabled)
    }

    pub fn set_synchronized(&self, enabled: bool) -> Result<()> {
        self.update("synchronized", |config| config.synchronized = enabled)
    }

    pub fn set_use_graphics(&self, enabled: bool) -> Result<()> {
        self.update("use_graphics", |config| config.use_graphics = enabled)
    }

    pub fn set_library_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.update("library_path", |config| config.library_path = path)
    }

    /// Load and initialize the library now instead of on first use
    pub fn ensure_ready(&self) -> Result<()> {
        let mut slot = self.inner.context.lock();
        self.inner.context_locked(&mut slot).map(|_| ())
    }

    /// Create a converter bound to the current context
    pub fn create(&self, settings: GlobalSettings) -> Result<PdfConverter> {
        let context = self.inner.acquire()?;
        match PdfConverter::new(Arc::clone(&self.inner), Arc::clone(&context), settings) {
            Ok(converter) => Ok(converter),
            Err(e) => {
                self.inner.release(&context);
                Err(e)
            }
        }
    }

    /// Tear the current context down, disposing converters still alive in it
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// `wkhtmltopdf_version` of the library
    pub fn version(&self) -> Result<String> {
        self.inner.query(|library| library.version())
    }

    /// Whether the library was built against the patched Qt
    pub fn extended_qt(&self) -> Result<bool> {
        self.inner.query(|library| library.extended_qt())
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.context.lock().is_some()
    }

    pub fn live_converters(&self) -> usize {
        self.inner.context.lock().as_ref().map_or(0, |context| context.live())
    }

    /// Worker thread of the current context, in synchronized mode
    pub fn worker_thread(&self) -> Option<ThreadId> {
        self.inner
            .context
            .lock()
            .as_ref()
            .and_then(|context| context.worker_thread())
    }
}
