//! wkhtmltox loaded from a shared object at runtime
//!
//! Symbols are resolved once when the library is opened and kept as plain
//! function pointers next to the `libloading::Library` that owns them.

use std::collections::BTreeMap;
use std::ffi::{c_void, CStr, OsStr};
use std::os::raw::{c_char, c_int, c_long, c_uchar};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use super::{
    string_from_ptr, ConverterHandle, GlobalSettingsHandle, IntCallback, LibraryLoader,
    NativeLibrary, ObjectSettingsHandle, StrCallback, VoidCallback,
};
use crate::error::{Error, Result};

/// Platform file name of the wkhtmltox shared library
pub fn default_library_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "wkhtmltox.dll"
    } else if cfg!(target_os = "macos") {
        "libwkhtmltox.dylib"
    } else {
        "libwkhtmltox.so"
    }
}

struct Api {
    init: unsafe extern "C" fn(c_int) -> c_int,
    deinit: unsafe extern "C" fn() -> c_int,
    version: unsafe extern "C" fn() -> *const c_char,
    extended_qt: unsafe extern "C" fn() -> c_int,
    create_global_settings: unsafe extern "C" fn() -> *mut c_void,
    create_object_settings: unsafe extern "C" fn() -> *mut c_void,
    destroy_global_settings: Option<unsafe extern "C" fn(*mut c_void)>,
    destroy_object_settings: Option<unsafe extern "C" fn(*mut c_void)>,
    set_global_setting: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int,
    get_global_setting: unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char, c_int) -> c_int,
    set_object_setting: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int,
    get_object_setting: unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char, c_int) -> c_int,
    create_converter: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
    destroy_converter: unsafe extern "C" fn(*mut c_void),
    set_warning_callback: unsafe extern "C" fn(*mut c_void, StrCallback),
    set_error_callback: unsafe extern "C" fn(*mut c_void, StrCallback),
    set_phase_changed_callback: unsafe extern "C" fn(*mut c_void, VoidCallback),
    set_progress_changed_callback: unsafe extern "C" fn(*mut c_void, IntCallback),
    set_finished_callback: unsafe extern "C" fn(*mut c_void, IntCallback),
    add_object: unsafe extern "C" fn(*mut c_void, *mut c_void, *const c_char),
    convert: unsafe extern "C" fn(*mut c_void) -> c_int,
    current_phase: unsafe extern "C" fn(*mut c_void) -> c_int,
    phase_count: unsafe extern "C" fn(*mut c_void) -> c_int,
    phase_description: unsafe extern "C" fn(*mut c_void, c_int) -> *const c_char,
    progress_string: unsafe extern "C" fn(*mut c_void) -> *const c_char,
    http_error_code: unsafe extern "C" fn(*mut c_void) -> c_int,
    get_output: unsafe extern "C" fn(*mut c_void, *mut *const c_uchar) -> c_long,
}

/// Resolve `name` to a bare function pointer.
///
/// # Safety
///
/// `T` must match the exported symbol's real signature.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    let symbol = library.get::<T>(name)?;
    Ok(*symbol)
}

/// wkhtmltox bound through `libloading`
pub struct SharedLibrary {
    api: Api,
    path: PathBuf,
    // Declared after the function pointers so they are never outlived.
    _library: Library,
    _residency: Residency,
}

/// Open `SharedLibrary` instances per path, across every manager in the process
static OPEN_LIBRARIES: Mutex<BTreeMap<PathBuf, usize>> = parking_lot::const_mutex(BTreeMap::new());

/// One entry in [`OPEN_LIBRARIES`], removed on drop
struct Residency {
    path: PathBuf,
}

impl Residency {
    fn register(open: &mut BTreeMap<PathBuf, usize>, path: &Path) -> Self {
        *open.entry(path.to_path_buf()).or_insert(0) += 1;
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Drop for Residency {
    fn drop(&mut self) {
        let mut open = OPEN_LIBRARIES.lock();
        if let Some(count) = open.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                open.remove(&self.path);
            }
        }
    }
}

impl SharedLibrary {
    /// Open the shared object at `path` and resolve every entry point
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Held until registered, so an unlink cannot slip in between
        let mut open = OPEN_LIBRARIES.lock();

        // SAFETY: loading wkhtmltox runs its static initializers, which have
        // no preconditions beyond being loaded once per context.
        let library = unsafe { Library::new(path.as_os_str()) }
            .map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;

        // SAFETY: every signature below matches wkhtmltox/pdf.h.
        let api = unsafe {
            Api {
                init: symbol(&library, b"wkhtmltopdf_init\0")?,
                deinit: symbol(&library, b"wkhtmltopdf_deinit\0")?,
                version: symbol(&library, b"wkhtmltopdf_version\0")?,
                extended_qt: symbol(&library, b"wkhtmltopdf_extended_qt\0")?,
                create_global_settings: symbol(&library, b"wkhtmltopdf_create_global_settings\0")?,
                create_object_settings: symbol(&library, b"wkhtmltopdf_create_object_settings\0")?,
                // Only exported by 0.12.x builds
                destroy_global_settings: symbol(&library, b"wkhtmltopdf_destroy_global_settings\0").ok(),
                destroy_object_settings: symbol(&library, b"wkhtmltopdf_destroy_object_settings\0").ok(),
                set_global_setting: symbol(&library, b"wkhtmltopdf_set_global_setting\0")?,
                get_global_setting: symbol(&library, b"wkhtmltopdf_get_global_setting\0")?,
                set_object_setting: symbol(&library, b"wkhtmltopdf_set_object_setting\0")?,
                get_object_setting: symbol(&library, b"wkhtmltopdf_get_object_setting\0")?,
                create_converter: symbol(&library, b"wkhtmltopdf_create_converter\0")?,
                destroy_converter: symbol(&library, b"wkhtmltopdf_destroy_converter\0")?,
                set_warning_callback: symbol(&library, b"wkhtmltopdf_set_warning_callback\0")?,
                set_error_callback: symbol(&library, b"wkhtmltopdf_set_error_callback\0")?,
                set_phase_changed_callback: symbol(&library, b"wkhtmltopdf_set_phase_changed_callback\0")?,
                set_progress_changed_callback: symbol(&library, b"wkhtmltopdf_set_progress_changed_callback\0")?,
                set_finished_callback: symbol(&library, b"wkhtmltopdf_set_finished_callback\0")?,
                add_object: symbol(&library, b"wkhtmltopdf_add_object\0")?,
                convert: symbol(&library, b"wkhtmltopdf_convert\0")?,
                current_phase: symbol(&library, b"wkhtmltopdf_current_phase\0")?,
                phase_count: symbol(&library, b"wkhtmltopdf_phase_count\0")?,
                phase_description: symbol(&library, b"wkhtmltopdf_phase_description\0")?,
                progress_string: symbol(&library, b"wkhtmltopdf_progress_string\0")?,
                http_error_code: symbol(&library, b"wkhtmltopdf_http_error_code\0")?,
                get_output: symbol(&library, b"wkhtmltopdf_get_output\0")?,
            }
        };

        let residency = Residency::register(&mut open, &path);
        drop(open);
        tracing::debug!(path = %path.display(), "Loaded wkhtmltox");

        Ok(Self {
            api,
            path,
            _library: library,
            _residency: residency,
        })
    }

    /// Path the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NativeLibrary for SharedLibrary {
    fn init(&self, use_graphics: bool) -> bool {
        tracing::trace!(use_graphics, "wkhtmltopdf_init");
        unsafe { (self.api.init)(c_int::from(use_graphics)) != 0 }
    }

    fn deinit(&self) -> bool {
        tracing::trace!("wkhtmltopdf_deinit");
        unsafe { (self.api.deinit)() != 0 }
    }

    fn version(&self) -> String {
        unsafe { string_from_ptr((self.api.version)()) }
    }

    fn extended_qt(&self) -> bool {
        unsafe { (self.api.extended_qt)() != 0 }
    }

    fn create_global_settings(&self) -> Option<GlobalSettingsHandle> {
        tracing::trace!("wkhtmltopdf_create_global_settings");
        GlobalSettingsHandle::from_ptr(unsafe { (self.api.create_global_settings)() })
    }

    fn create_object_settings(&self) -> Option<ObjectSettingsHandle> {
        tracing::trace!("wkhtmltopdf_create_object_settings");
        ObjectSettingsHandle::from_ptr(unsafe { (self.api.create_object_settings)() })
    }

    unsafe fn destroy_global_settings(&self, settings: GlobalSettingsHandle) {
        match self.api.destroy_global_settings {
            Some(destroy) => destroy(settings.as_ptr()),
            None => tracing::warn!("wkhtmltopdf_destroy_global_settings unavailable; leaking settings"),
        }
    }

    unsafe fn destroy_object_settings(&self, settings: ObjectSettingsHandle) {
        match self.api.destroy_object_settings {
            Some(destroy) => destroy(settings.as_ptr()),
            None => tracing::warn!("wkhtmltopdf_destroy_object_settings unavailable; leaking settings"),
        }
    }

    unsafe fn set_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, value: &CStr) -> bool {
        (self.api.set_global_setting)(settings.as_ptr(), name.as_ptr(), value.as_ptr()) != 0
    }

    unsafe fn get_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool {
        (self.api.get_global_setting)(
            settings.as_ptr(),
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut c_char,
            buffer.len() as c_int,
        ) != 0
    }

    unsafe fn set_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, value: &CStr) -> bool {
        (self.api.set_object_setting)(settings.as_ptr(), name.as_ptr(), value.as_ptr()) != 0
    }

    unsafe fn get_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool {
        (self.api.get_object_setting)(
            settings.as_ptr(),
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut c_char,
            buffer.len() as c_int,
        ) != 0
    }

    unsafe fn create_converter(&self, settings: GlobalSettingsHandle) -> Option<ConverterHandle> {
        tracing::trace!("wkhtmltopdf_create_converter");
        ConverterHandle::from_ptr((self.api.create_converter)(settings.as_ptr()))
    }

    unsafe fn destroy_converter(&self, converter: ConverterHandle) {
        tracing::trace!("wkhtmltopdf_destroy_converter");
        (self.api.destroy_converter)(converter.as_ptr())
    }

    unsafe fn set_warning_callback(&self, converter: ConverterHandle, callback: StrCallback) {
        (self.api.set_warning_callback)(converter.as_ptr(), callback)
    }

    unsafe fn set_error_callback(&self, converter: ConverterHandle, callback: StrCallback) {
        (self.api.set_error_callback)(converter.as_ptr(), callback)
    }

    unsafe fn set_phase_changed_callback(&self, converter: ConverterHandle, callback: VoidCallback) {
        (self.api.set_phase_changed_callback)(converter.as_ptr(), callback)
    }

    unsafe fn set_progress_changed_callback(&self, converter: ConverterHandle, callback: IntCallback) {
        (self.api.set_progress_changed_callback)(converter.as_ptr(), callback)
    }

    unsafe fn set_finished_callback(&self, converter: ConverterHandle, callback: IntCallback) {
        (self.api.set_finished_callback)(converter.as_ptr(), callback)
    }

    unsafe fn add_object(&self, converter: ConverterHandle, settings: ObjectSettingsHandle, data: Option<&CStr>) {
        tracing::trace!(inline = data.is_some(), "wkhtmltopdf_add_object");
        let data = data.map_or(std::ptr::null(), CStr::as_ptr);
        (self.api.add_object)(converter.as_ptr(), settings.as_ptr(), data)
    }

    unsafe fn convert(&self, converter: ConverterHandle) -> bool {
        tracing::trace!("wkhtmltopdf_convert");
        (self.api.convert)(converter.as_ptr()) != 0
    }

    unsafe fn current_phase(&self, converter: ConverterHandle) -> i32 {
        (self.api.current_phase)(converter.as_ptr())
    }

    unsafe fn phase_count(&self, converter: ConverterHandle) -> i32 {
        (self.api.phase_count)(converter.as_ptr())
    }

    unsafe fn phase_description(&self, converter: ConverterHandle, phase: i32) -> String {
        string_from_ptr((self.api.phase_description)(converter.as_ptr(), phase))
    }

    unsafe fn progress_string(&self, converter: ConverterHandle) -> String {
        string_from_ptr((self.api.progress_string)(converter.as_ptr()))
    }

    unsafe fn http_error_code(&self, converter: ConverterHandle) -> i32 {
        (self.api.http_error_code)(converter.as_ptr())
    }

    unsafe fn output(&self, converter: ConverterHandle) -> Vec<u8> {
        let mut data: *const c_uchar = std::ptr::null();
        let len = (self.api.get_output)(converter.as_ptr(), &mut data);
        if data.is_null() || len <= 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(data, len as usize).to_vec()
    }
}

/// Loads wkhtmltox with `libloading`, once per isolation context
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedObjectLoader;

impl LibraryLoader for SharedObjectLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn NativeLibrary>> {
        Ok(Arc::new(SharedLibrary::open(path)?))
    }

    fn unlink(&self, path: &Path) -> bool {
        let open = OPEN_LIBRARIES.lock();
        if let Some(count) = open.get(path) {
            tracing::debug!(path = %path.display(), open = *count, "Module still open elsewhere; not unlinking");
            return false;
        }
        release_resident(path.as_os_str())
    }
}

#[cfg(target_os = "linux")]
const RTLD_NOLOAD: c_int = 0x4;
#[cfg(target_os = "macos")]
const RTLD_NOLOAD: c_int = 0x10;

/// Drop one leftover reference to a module that is still mapped.
///
/// Opening with `RTLD_NOLOAD` only succeeds while the module is resident and
/// adds a reference of its own, so two closes release that probe plus one
/// reference left behind by an earlier load.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn release_resident(path: &OsStr) -> bool {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY};

    // SAFETY: RTLD_NOLOAD never runs initializers; it only bumps the
    // reference count of an already mapped module.
    let probe = match unsafe { UnixLibrary::open(Some(path), RTLD_LAZY | RTLD_NOLOAD) } {
        Ok(library) => library,
        Err(_) => return false,
    };

    let raw = probe.into_raw();
    // SAFETY: the module holds at least two references here: the probe and
    // the stale one being released.
    let (probe, stale) = unsafe { (UnixLibrary::from_raw(raw), UnixLibrary::from_raw(raw)) };
    probe.close().is_ok() && stale.close().is_ok()
}

#[cfg(windows)]
fn release_resident(path: &OsStr) -> bool {
    use libloading::os::windows::Library as WindowsLibrary;

    #[allow(unused_unsafe)]
    let probe = match unsafe { WindowsLibrary::open_already_loaded(path) } {
        Ok(library) => library,
        Err(_) => return false,
    };

    let raw = probe.into_raw();
    // SAFETY: see the unix variant; GetModuleHandleEx added the probe's reference.
    let (probe, stale) = unsafe { (WindowsLibrary::from_raw(raw), WindowsLibrary::from_raw(raw)) };
    probe.close().is_ok() && stale.close().is_ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn release_resident(_path: &OsStr) -> bool {
    false
}
