//! Single-request converter
//!
//! A [`Converter`] owns at most one native converter handle and rebuilds it
//! from scratch on every [`Converter::convert`], since the library cannot
//! run a converter twice. Native callbacks carry no user data, so while a
//! conversion runs the handle address is registered in a thread-local table
//! that the `extern "C"` trampolines use to find their converter.
//!
//! ```text
//! convert()
//!    │  destroy previous handle
//!    │  create global settings ─► create converter ─► register callbacks
//!    │  create object settings ─► add object
//!    │  emit Begin
//!    ▼
//! native convert ──callback──► trampoline ──► EventHub::emit
//! ```
//!
//! Converters are not thread-safe with respect to the native library; the
//! isolation context guarantees every call reaches them serialized.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dispatch::panic_message;
use crate::error::{Error, Result};
use crate::events::{ConverterEvent, EventHub, SubscriptionId};
use crate::native::{
    string_from_buffer, string_from_ptr, ConverterHandle, GlobalSettingsHandle, NativeLibrary,
    ObjectSettingsHandle, SETTING_BUFFER_LEN,
};
use crate::settings::{GlobalSettings, ObjectSettings};

/// Identifier shared by a remote converter and its proxy sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConverterId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ConverterId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConverterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a converter is in its request cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    Idle,
    Configuring,
    Converting,
    Succeeded,
    Failed,
}

/// Document content handed to the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Html(String),
    Bytes(Vec<u8>),
    /// Load the object's `page` setting instead
    FromPage,
}

impl Content {
    fn into_c_string(self) -> Result<Option<CString>> {
        let bytes = match self {
            Content::Html(html) => html.into_bytes(),
            Content::Bytes(bytes) => bytes,
            Content::FromPage => return Ok(None),
        };
        CString::new(bytes)
            .map(Some)
            .map_err(|e| Error::InvalidContent(format!("NUL byte at offset {}", e.nul_position())))
    }
}

impl From<&str> for Content {
    fn from(html: &str) -> Self {
        Content::Html(html.to_string())
    }
}

impl From<String> for Content {
    fn from(html: String) -> Self {
        Content::Html(html)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Bytes(bytes)
    }
}

impl From<&[u8]> for Content {
    fn from(bytes: &[u8]) -> Self {
        Content::Bytes(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
struct NativeState {
    converter: ConverterHandle,
    // Both adopted by `converter`; kept only for reading settings back.
    global: GlobalSettingsHandle,
    object: ObjectSettingsHandle,
}

/// Clears the busy flag when the operation holding it ends
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

thread_local! {
    static CALLBACK_TARGETS: RefCell<HashMap<usize, Weak<Converter>>> = RefCell::new(HashMap::new());
}

/// Routes callbacks for one handle to its converter for the scope's lifetime
struct CallbackScope {
    key: usize,
}

impl CallbackScope {
    fn enter(handle: ConverterHandle, target: Weak<Converter>) -> Self {
        let key = handle.addr();
        CALLBACK_TARGETS.with(|targets| targets.borrow_mut().insert(key, target));
        Self { key }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_TARGETS.with(|targets| targets.borrow_mut().remove(&self.key));
    }
}

fn callback_target(handle: ConverterHandle) -> Option<Arc<Converter>> {
    CALLBACK_TARGETS.with(|targets| targets.borrow().get(&handle.addr()).and_then(Weak::upgrade))
}

/// Runs one native conversion at a time against its isolation context's library
pub struct Converter {
    id: ConverterId,
    library: Weak<dyn NativeLibrary>,
    settings: GlobalSettings,
    native: Mutex<Option<NativeState>>,
    state: Mutex<ConversionState>,
    converting: AtomicBool,
    disposed: AtomicBool,
    events: EventHub<Converter>,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Converter {
    /// The converter only holds a weak reference; calls fail with
    /// [`Error::ContextClosed`] once the library has been dropped.
    pub(crate) fn new(library: &Arc<dyn NativeLibrary>, settings: GlobalSettings) -> Arc<Self> {
        let converter = Arc::new(Self {
            id: ConverterId::next(),
            library: Arc::downgrade(library),
            settings,
            native: Mutex::new(None),
            state: Mutex::new(ConversionState::Idle),
            converting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            events: EventHub::new(),
        });
        tracing::debug!(converter = %converter.id, "Converter created");
        converter
    }

    pub fn id(&self) -> ConverterId {
        self.id
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn state(&self) -> ConversionState {
        *self.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Converter, &ConverterEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn emit(&self, event: ConverterEvent) {
        tracing::trace!(converter = %self.id, event = event.kind(), "Converter event");
        self.events.emit(self, &event);
    }

    fn set_state(&self, state: ConversionState) {
        *self.state.lock() = state;
    }

    fn library(&self) -> Result<Arc<dyn NativeLibrary>> {
        self.library.upgrade().ok_or(Error::ContextClosed)
    }

    /// Convert one object with this converter's global settings.
    ///
    /// Returns `Ok(None)` when the library reports failure; the `Error` and
    /// `Finished` events carry the details.
    pub fn convert(self: &Arc<Self>, object: &ObjectSettings, content: Content) -> Result<Option<Vec<u8>>> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let _busy = BusyGuard::acquire(&self.converting)?;

        let data = content.into_c_string()?;
        let global_pairs = c_pairs(self.settings.pairs())?;
        let object_pairs = c_pairs(object.pairs())?;
        let library = self.library()?;

        self.set_state(ConversionState::Configuring);
        self.release_native();

        let state = match build(library.as_ref(), &global_pairs, &object_pairs, data.as_deref()) {
            Ok(state) => state,
            Err(e) => {
                self.set_state(ConversionState::Failed);
                return Err(e);
            }
        };
        *self.native.lock() = Some(state);
        let handle = state.converter;

        let _scope = CallbackScope::enter(handle, Arc::downgrade(self));

        let phase_count = unsafe { library.phase_count(handle) };
        self.emit(ConverterEvent::Begin { phase_count });

        self.set_state(ConversionState::Converting);
        tracing::debug!(converter = %self.id, inline = data.is_some(), "Starting conversion");

        if !unsafe { library.convert(handle) } {
            self.set_state(ConversionState::Failed);
            tracing::debug!(converter = %self.id, "Conversion failed");
            return Ok(None);
        }

        let output = unsafe { library.output(handle) };
        self.set_state(ConversionState::Succeeded);
        tracing::debug!(converter = %self.id, bytes = output.len(), "Conversion finished");
        Ok(Some(output))
    }

    fn with_native<R>(&self, f: impl FnOnce(&dyn NativeLibrary, NativeState) -> R) -> Result<R> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let state = (*self.native.lock()).ok_or(Error::NoConversion)?;
        let library = self.library()?;
        Ok(f(library.as_ref(), state))
    }

    pub fn current_phase(&self) -> Result<i32> {
        self.with_native(|library, state| unsafe { library.current_phase(state.converter) })
    }

    pub fn phase_count(&self) -> Result<i32> {
        self.with_native(|library, state| unsafe { library.phase_count(state.converter) })
    }

    pub fn phase_description(&self, phase: i32) -> Result<String> {
        self.with_native(|library, state| unsafe { library.phase_description(state.converter, phase) })
    }

    pub fn progress_string(&self) -> Result<String> {
        self.with_native(|library, state| unsafe { library.progress_string(state.converter) })
    }

    pub fn http_error_code(&self) -> Result<i32> {
        self.with_native(|library, state| unsafe { library.http_error_code(state.converter) })
    }

    /// Read a global setting back from the last conversion's handle.
    ///
    /// Values longer than the read buffer come back truncated.
    pub fn global_setting(&self, name: &str) -> Result<Option<String>> {
        let name = setting_name(name)?;
        self.with_native(|library, state| {
            let mut buffer = [0u8; SETTING_BUFFER_LEN];
            unsafe { library.get_global_setting(state.global, &name, &mut buffer) }
                .then(|| string_from_buffer(&buffer))
        })
    }

    pub fn object_setting(&self, name: &str) -> Result<Option<String>> {
        let name = setting_name(name)?;
        self.with_native(|library, state| {
            let mut buffer = [0u8; SETTING_BUFFER_LEN];
            unsafe { library.get_object_setting(state.object, &name, &mut buffer) }
                .then(|| string_from_buffer(&buffer))
        })
    }

    /// Release the native handle and fire `Disposed`. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        let _busy = BusyGuard::acquire(&self.converting)?;
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.release_native();
        tracing::debug!(converter = %self.id, "Converter disposed");
        self.emit(ConverterEvent::Disposed);
        Ok(())
    }

    fn release_native(&self) {
        let Some(state) = self.native.lock().take() else {
            return;
        };
        match self.library.upgrade() {
            Some(library) => unsafe { library.destroy_converter(state.converter) },
            None => tracing::warn!(
                converter = %self.id,
                "Library unloaded before converter handle was released"
            ),
        }
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        if self.native.get_mut().is_some() {
            tracing::warn!(converter = %self.id, "Converter dropped without dispose; releasing handle");
            self.release_native();
        }
    }
}

fn setting_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidContent(format!("setting name {:?}", name)))
}

fn c_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Result<Vec<(CString, CString)>> {
    pairs
        .map(|(key, value)| match (CString::new(key), CString::new(value)) {
            (Ok(key), Ok(value)) => Ok((key, value)),
            _ => Err(Error::InvalidContent(format!("setting {:?}", key))),
        })
        .collect()
}

/// Build a complete native converter for one conversion
fn build(
    library: &dyn NativeLibrary,
    global_pairs: &[(CString, CString)],
    object_pairs: &[(CString, CString)],
    data: Option<&CStr>,
) -> Result<NativeState> {
    let global = library
        .create_global_settings()
        .ok_or_else(|| Error::Native("could not allocate global settings".to_string()))?;
    for (key, value) in global_pairs {
        if !unsafe { library.set_global_setting(global, key, value) } {
            tracing::warn!(setting = ?key, "Library rejected global setting");
        }
    }

    let Some(converter) = (unsafe { library.create_converter(global) }) else {
        unsafe { library.destroy_global_settings(global) };
        return Err(Error::Native("could not create converter".to_string()));
    };

    unsafe {
        library.set_warning_callback(converter, warning_trampoline);
        library.set_error_callback(converter, error_trampoline);
        library.set_phase_changed_callback(converter, phase_changed_trampoline);
        library.set_progress_changed_callback(converter, progress_changed_trampoline);
        library.set_finished_callback(converter, finished_trampoline);
    }

    let Some(object) = library.create_object_settings() else {
        unsafe { library.destroy_converter(converter) };
        return Err(Error::Native("could not allocate object settings".to_string()));
    };
    for (key, value) in object_pairs {
        if !unsafe { library.set_object_setting(object, key, value) } {
            tracing::warn!(setting = ?key, "Library rejected object setting");
        }
    }

    unsafe { library.add_object(converter, object, data) };

    Ok(NativeState {
        converter,
        global,
        object,
    })
}

/// Deliver a native callback; panics never cross back into the library
fn deliver<F>(handle: *mut c_void, event: F)
where
    F: FnOnce(&dyn NativeLibrary, ConverterHandle) -> ConverterEvent,
{
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = ConverterHandle::from_ptr(handle) else {
            return;
        };
        let Some(converter) = callback_target(handle) else {
            tracing::trace!("Callback for an unregistered converter handle");
            return;
        };
        let Ok(library) = converter.library() else {
            return;
        };
        converter.emit(event(library.as_ref(), handle));
    }));

    if let Err(payload) = outcome {
        tracing::warn!(error = %panic_message(payload.as_ref()), "Native callback panicked");
    }
}

unsafe extern "C" fn warning_trampoline(handle: *mut c_void, message: *const c_char) {
    let message = string_from_ptr(message);
    deliver(handle, move |_, _| ConverterEvent::Warning(message));
}

unsafe extern "C" fn error_trampoline(handle: *mut c_void, message: *const c_char) {
    let message = string_from_ptr(message);
    deliver(handle, move |_, _| ConverterEvent::Error(message));
}

unsafe extern "C" fn phase_changed_trampoline(handle: *mut c_void) {
    deliver(handle, |library, handle| {
        let phase = unsafe { library.current_phase(handle) };
        let description = unsafe { library.phase_description(handle, phase) };
        ConverterEvent::PhaseChanged { phase, description }
    });
}

unsafe extern "C" fn progress_changed_trampoline(handle: *mut c_void, progress: c_int) {
    deliver(handle, |library, handle| ConverterEvent::ProgressChanged {
        progress,
        description: unsafe { library.progress_string(handle) },
    });
}

unsafe extern "C" fn finished_trampoline(handle: *mut c_void, success: c_int) {
    deliver(handle, |_, _| ConverterEvent::Finished { success: success != 0 });
}
