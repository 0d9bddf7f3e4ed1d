//! Scripted in-process stand-in for wkhtmltox
//!
//! Handles are boxed Rust values handed out as raw pointers, so everything
//! the real library would do with them (adoption by the converter, callbacks
//! keyed by the converter pointer, buffer truncation on reads) behaves the
//! same way. A shared [`FakeProbe`] lets tests observe what happened.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    ConverterHandle, GlobalSettingsHandle, IntCallback, LibraryLoader, NativeLibrary,
    ObjectSettingsHandle, StrCallback, VoidCallback,
};
use crate::error::{Error, Result};

/// Page URIs under this prefix fail to load
pub(crate) const UNREACHABLE: &str = "http://unreachable.invalid/";

const PHASES: [&str; 2] = ["Loading pages", "Printing pages"];

/// Observations shared between a test and every fake it loads
#[derive(Default)]
pub(crate) struct FakeProbe {
    pub loads: AtomicUsize,
    pub dropped: AtomicUsize,
    pub resident: AtomicUsize,
    pub unlinks: AtomicUsize,
    pub inits: AtomicUsize,
    pub deinits: AtomicUsize,
    pub graphics: AtomicBool,
    pub conversions: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub live_handles: AtomicIsize,
    pub fail_init: AtomicBool,
    pub fail_load: AtomicBool,
    in_flight: AtomicBool,
    paths: Mutex<Vec<PathBuf>>,
    delay: Mutex<Duration>,
    threads: Mutex<HashSet<ThreadId>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every conversion sleep, so overlapping calls would be caught
    pub fn set_convert_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Threads that have made a native call
    pub fn threads(&self) -> HashSet<ThreadId> {
        self.threads.lock().clone()
    }

    /// Paths passed to every load, in order
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }

    pub fn live_handles(&self) -> isize {
        self.live_handles.load(Ordering::SeqCst)
    }

    /// Loaded instances not yet dropped
    pub fn live_libraries(&self) -> usize {
        self.loads
            .load(Ordering::SeqCst)
            .saturating_sub(self.dropped.load(Ordering::SeqCst))
    }

    fn touch(&self) {
        self.threads.lock().insert(std::thread::current().id());
    }

    fn created(&self) {
        self.live_handles.fetch_add(1, Ordering::SeqCst);
    }

    fn destroyed(&self, count: usize) {
        self.live_handles.fetch_sub(count as isize, Ordering::SeqCst);
    }
}

type Settings = BTreeMap<String, String>;

struct FakeConverter {
    global: *mut Settings,
    objects: RefCell<Vec<(*mut Settings, Option<String>)>>,
    warning: Cell<Option<StrCallback>>,
    error: Cell<Option<StrCallback>>,
    phase_changed: Cell<Option<VoidCallback>>,
    progress_changed: Cell<Option<IntCallback>>,
    finished: Cell<Option<IntCallback>>,
    phase: Cell<i32>,
    progress: Cell<i32>,
    http_error: Cell<i32>,
    output: RefCell<Vec<u8>>,
}

/// In-process `NativeLibrary`
pub(crate) struct FakeLibrary {
    probe: Arc<FakeProbe>,
}

impl FakeLibrary {
    pub fn new(probe: Arc<FakeProbe>) -> Self {
        Self { probe }
    }

    unsafe fn converter<'a>(handle: ConverterHandle) -> &'a FakeConverter {
        &*(handle.as_ptr() as *const FakeConverter)
    }

    unsafe fn settings<'a>(ptr: *mut c_void) -> &'a mut Settings {
        &mut *(ptr as *mut Settings)
    }

    unsafe fn read_into(values: &Settings, name: &CStr, buffer: &mut [u8]) -> bool {
        let Some(value) = values.get(name.to_string_lossy().as_ref()) else {
            return false;
        };
        if buffer.is_empty() {
            return false;
        }
        let len = value.len().min(buffer.len() - 1);
        buffer[..len].copy_from_slice(&value.as_bytes()[..len]);
        buffer[len] = 0;
        true
    }

    unsafe fn fire_str(&self, handle: ConverterHandle, callback: Option<StrCallback>, message: &str) {
        if let Some(callback) = callback {
            let message = CString::new(message).unwrap_or_default();
            callback(handle.as_ptr(), message.as_ptr());
        }
    }

    unsafe fn fire_int(&self, handle: ConverterHandle, callback: Option<IntCallback>, value: i32) {
        if let Some(callback) = callback {
            callback(handle.as_ptr(), value);
        }
    }

    unsafe fn enter_phase(&self, handle: ConverterHandle, phase: i32) {
        let converter = Self::converter(handle);
        converter.phase.set(phase);
        if let Some(callback) = converter.phase_changed.get() {
            callback(handle.as_ptr());
        }
    }

    unsafe fn run(&self, handle: ConverterHandle) -> bool {
        let converter = Self::converter(handle);
        converter.http_error.set(0);
        converter.output.borrow_mut().clear();

        self.enter_phase(handle, 0);

        let objects: Vec<(Settings, Option<String>)> = converter
            .objects
            .borrow()
            .iter()
            .map(|(settings, data)| ((**settings).clone(), data.clone()))
            .collect();

        let mut body = String::new();
        let mut failed = false;
        for (index, (settings, data)) in objects.iter().enumerate() {
            let page = settings.get("page").cloned().unwrap_or_default();
            match data {
                Some(html) => body.push_str(html),
                None if page.starts_with(UNREACHABLE) => {
                    converter.http_error.set(404);
                    self.fire_str(handle, converter.error.get(), &format!("Failed loading page {}", page));
                    match settings.get("load.loadErrorHandling").map(String::as_str) {
                        Some("ignore") | Some("skip") => {
                            self.fire_str(handle, converter.warning.get(), &format!("Skipping page {}", page));
                        }
                        _ => failed = true,
                    }
                }
                None => body.push_str(&format!("<page src=\"{}\"/>", page)),
            }
            let progress = ((index + 1) * 100 / objects.len().max(1)) as i32;
            converter.progress.set(progress);
            self.fire_int(handle, converter.progress_changed.get(), progress);
        }

        self.enter_phase(handle, 1);

        if failed {
            self.fire_int(handle, converter.finished.get(), 0);
            return false;
        }

        let global = &*converter.global;
        let header = match global.get("outputFormat").map(String::as_str) {
            Some("ps") => "%!PS-Adobe-3.0\n",
            _ => "%PDF-1.4\n",
        };
        {
            let mut output = converter.output.borrow_mut();
            output.extend_from_slice(header.as_bytes());
            output.extend_from_slice(body.as_bytes());
            output.extend_from_slice(b"\n%%EOF\n");
        }

        converter.progress.set(100);
        self.fire_int(handle, converter.finished.get(), 1);
        true
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        self.probe.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl NativeLibrary for FakeLibrary {
    fn init(&self, use_graphics: bool) -> bool {
        self.probe.touch();
        self.probe.graphics.store(use_graphics, Ordering::SeqCst);
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        !self.probe.fail_init.load(Ordering::SeqCst)
    }

    fn deinit(&self) -> bool {
        self.probe.touch();
        // Tearing down under a running conversion
        if self.probe.in_flight.load(Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.probe.deinits.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn version(&self) -> String {
        self.probe.touch();
        "0.12.6-fake".to_string()
    }

    fn extended_qt(&self) -> bool {
        self.probe.touch();
        true
    }

    fn create_global_settings(&self) -> Option<GlobalSettingsHandle> {
        self.probe.touch();
        self.probe.created();
        GlobalSettingsHandle::from_ptr(Box::into_raw(Box::<Settings>::default()) as *mut c_void)
    }

    fn create_object_settings(&self) -> Option<ObjectSettingsHandle> {
        self.probe.touch();
        self.probe.created();
        ObjectSettingsHandle::from_ptr(Box::into_raw(Box::<Settings>::default()) as *mut c_void)
    }

    unsafe fn destroy_global_settings(&self, settings: GlobalSettingsHandle) {
        self.probe.touch();
        self.probe.destroyed(1);
        drop(Box::from_raw(settings.as_ptr() as *mut Settings));
    }

    unsafe fn destroy_object_settings(&self, settings: ObjectSettingsHandle) {
        self.probe.touch();
        self.probe.destroyed(1);
        drop(Box::from_raw(settings.as_ptr() as *mut Settings));
    }

    unsafe fn set_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, value: &CStr) -> bool {
        self.probe.touch();
        Self::settings(settings.as_ptr()).insert(
            name.to_string_lossy().into_owned(),
            value.to_string_lossy().into_owned(),
        );
        true
    }

    unsafe fn get_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool {
        self.probe.touch();
        Self::read_into(Self::settings(settings.as_ptr()), name, buffer)
    }

    unsafe fn set_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, value: &CStr) -> bool {
        self.probe.touch();
        Self::settings(settings.as_ptr()).insert(
            name.to_string_lossy().into_owned(),
            value.to_string_lossy().into_owned(),
        );
        true
    }

    unsafe fn get_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool {
        self.probe.touch();
        Self::read_into(Self::settings(settings.as_ptr()), name, buffer)
    }

    unsafe fn create_converter(&self, settings: GlobalSettingsHandle) -> Option<ConverterHandle> {
        self.probe.touch();
        self.probe.created();
        let converter = Box::new(FakeConverter {
            global: settings.as_ptr() as *mut Settings,
            objects: RefCell::new(Vec::new()),
            warning: Cell::new(None),
            error: Cell::new(None),
            phase_changed: Cell::new(None),
            progress_changed: Cell::new(None),
            finished: Cell::new(None),
            phase: Cell::new(0),
            progress: Cell::new(0),
            http_error: Cell::new(0),
            output: RefCell::new(Vec::new()),
        });
        ConverterHandle::from_ptr(Box::into_raw(converter) as *mut c_void)
    }

    unsafe fn destroy_converter(&self, converter: ConverterHandle) {
        self.probe.touch();
        let converter = Box::from_raw(converter.as_ptr() as *mut FakeConverter);
        let objects = converter.objects.take();
        self.probe.destroyed(2 + objects.len());
        for (settings, _) in objects {
            drop(Box::from_raw(settings));
        }
        drop(Box::from_raw(converter.global));
    }

    unsafe fn set_warning_callback(&self, converter: ConverterHandle, callback: StrCallback) {
        self.probe.touch();
        Self::converter(converter).warning.set(Some(callback));
    }

    unsafe fn set_error_callback(&self, converter: ConverterHandle, callback: StrCallback) {
        self.probe.touch();
        Self::converter(converter).error.set(Some(callback));
    }

    unsafe fn set_phase_changed_callback(&self, converter: ConverterHandle, callback: VoidCallback) {
        self.probe.touch();
        Self::converter(converter).phase_changed.set(Some(callback));
    }

    unsafe fn set_progress_changed_callback(&self, converter: ConverterHandle, callback: IntCallback) {
        self.probe.touch();
        Self::converter(converter).progress_changed.set(Some(callback));
    }

    unsafe fn set_finished_callback(&self, converter: ConverterHandle, callback: IntCallback) {
        self.probe.touch();
        Self::converter(converter).finished.set(Some(callback));
    }

    unsafe fn add_object(&self, converter: ConverterHandle, settings: ObjectSettingsHandle, data: Option<&CStr>) {
        self.probe.touch();
        let data = data.map(|data| data.to_string_lossy().into_owned());
        Self::converter(converter)
            .objects
            .borrow_mut()
            .push((settings.as_ptr() as *mut Settings, data));
    }

    unsafe fn convert(&self, converter: ConverterHandle) -> bool {
        self.probe.touch();
        if self.probe.in_flight.swap(true, Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.probe.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.probe.conversions.fetch_add(1, Ordering::SeqCst);

        let ok = self.run(converter);

        self.probe.in_flight.store(false, Ordering::SeqCst);
        ok
    }

    unsafe fn current_phase(&self, converter: ConverterHandle) -> i32 {
        self.probe.touch();
        Self::converter(converter).phase.get()
    }

    unsafe fn phase_count(&self, _converter: ConverterHandle) -> i32 {
        self.probe.touch();
        PHASES.len() as i32
    }

    unsafe fn phase_description(&self, _converter: ConverterHandle, phase: i32) -> String {
        self.probe.touch();
        usize::try_from(phase)
            .ok()
            .and_then(|phase| PHASES.get(phase))
            .map(|description| description.to_string())
            .unwrap_or_default()
    }

    unsafe fn progress_string(&self, converter: ConverterHandle) -> String {
        self.probe.touch();
        format!("{}%", Self::converter(converter).progress.get())
    }

    unsafe fn http_error_code(&self, converter: ConverterHandle) -> i32 {
        self.probe.touch();
        Self::converter(converter).http_error.get()
    }

    unsafe fn output(&self, converter: ConverterHandle) -> Vec<u8> {
        self.probe.touch();
        Self::converter(converter).output.borrow().clone()
    }
}

/// Loader handing out [`FakeLibrary`] instances that share one probe
pub(crate) struct FakeLoader {
    probe: Arc<FakeProbe>,
}

impl FakeLoader {
    pub fn new(probe: Arc<FakeProbe>) -> Arc<Self> {
        Arc::new(Self { probe })
    }
}

impl LibraryLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn NativeLibrary>> {
        if self.probe.fail_load.load(Ordering::SeqCst) {
            return Err(Error::Load(format!("{}: refused to load", path.display())));
        }
        self.probe.paths.lock().push(path.to_path_buf());
        self.probe.loads.fetch_add(1, Ordering::SeqCst);
        self.probe.resident.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLibrary::new(Arc::clone(&self.probe))))
    }

    fn unlink(&self, _path: &Path) -> bool {
        self.probe.unlinks.fetch_add(1, Ordering::SeqCst);
        if self.probe.live_libraries() > 0 {
            return false;
        }
        self.probe
            .resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |resident| resident.checked_sub(1))
            .is_ok()
    }
}
