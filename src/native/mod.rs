//! Native Call Surface
//!
//! The wkhtmltox C ABI, expressed as the [`NativeLibrary`] trait so the rest
//! of the crate never touches raw symbols. [`SharedLibrary`] resolves the real
//! entry points from a shared object at runtime; a [`LibraryLoader`] produces
//! one such instance per isolation context and knows how to unlink the module
//! from the process afterwards.
//!
//! # Handles
//!
//! Settings and converter handles are opaque pointers owned by the native
//! library. They are `Send` so they can be stored in structures shared with
//! the dispatcher, but they must only be passed back to the library instance
//! that created them, and only while that instance is loaded.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;

mod library;

#[cfg(test)]
pub(crate) mod fake;

pub use library::{default_library_name, SharedLibrary, SharedObjectLoader};

/// Size of the buffer used when reading a setting back from the library
pub const SETTING_BUFFER_LEN: usize = 2048;

/// `void (*)(wkhtmltopdf_converter *, const char *)`
pub type StrCallback = unsafe extern "C" fn(converter: *mut c_void, message: *const c_char);

/// `void (*)(wkhtmltopdf_converter *, const int)`
pub type IntCallback = unsafe extern "C" fn(converter: *mut c_void, value: c_int);

/// `void (*)(wkhtmltopdf_converter *)`
pub type VoidCallback = unsafe extern "C" fn(converter: *mut c_void);

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonNull<c_void>);

        impl $name {
            /// Wrap a raw pointer returned by the library; `None` for null
            pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
                NonNull::new(ptr).map(Self)
            }

            /// Raw pointer for passing back across the ABI
            pub fn as_ptr(self) -> *mut c_void {
                self.0.as_ptr()
            }

            /// Address used as a lookup key
            pub fn addr(self) -> usize {
                self.0.as_ptr() as usize
            }
        }

        // SAFETY: the pointer is an opaque token; it is only dereferenced by
        // the native library, and all such calls are serialized per isolation
        // context by the dispatcher (or the context's call gate).
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

native_handle!(
    /// `wkhtmltopdf_global_settings *`
    GlobalSettingsHandle
);
native_handle!(
    /// `wkhtmltopdf_object_settings *`
    ObjectSettingsHandle
);
native_handle!(
    /// `wkhtmltopdf_converter *`
    ConverterHandle
);

/// The wkhtmltox entry points used by the converter
///
/// Handle-taking methods are `unsafe`: callers must pass handles created by
/// the same instance that have not been destroyed yet. A converter adopts the
/// global settings it was created from and every object added to it; those
/// are released by [`NativeLibrary::destroy_converter`].
pub trait NativeLibrary: Send + Sync {
    /// `wkhtmltopdf_init`
    fn init(&self, use_graphics: bool) -> bool;

    /// `wkhtmltopdf_deinit`
    fn deinit(&self) -> bool;

    /// `wkhtmltopdf_version`
    fn version(&self) -> String;

    /// `wkhtmltopdf_extended_qt`
    fn extended_qt(&self) -> bool;

    fn create_global_settings(&self) -> Option<GlobalSettingsHandle>;

    fn create_object_settings(&self) -> Option<ObjectSettingsHandle>;

    /// Release settings that were never handed to a converter
    unsafe fn destroy_global_settings(&self, settings: GlobalSettingsHandle);

    /// Release settings that were never added to a converter
    unsafe fn destroy_object_settings(&self, settings: ObjectSettingsHandle);

    unsafe fn set_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, value: &CStr) -> bool;

    /// Copy a setting into `buffer` as a NUL-terminated string
    unsafe fn get_global_setting(&self, settings: GlobalSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool;

    unsafe fn set_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, value: &CStr) -> bool;

    unsafe fn get_object_setting(&self, settings: ObjectSettingsHandle, name: &CStr, buffer: &mut [u8]) -> bool;

    unsafe fn create_converter(&self, settings: GlobalSettingsHandle) -> Option<ConverterHandle>;

    unsafe fn destroy_converter(&self, converter: ConverterHandle);

    unsafe fn set_warning_callback(&self, converter: ConverterHandle, callback: StrCallback);

    unsafe fn set_error_callback(&self, converter: ConverterHandle, callback: StrCallback);

    unsafe fn set_phase_changed_callback(&self, converter: ConverterHandle, callback: VoidCallback);

    unsafe fn set_progress_changed_callback(&self, converter: ConverterHandle, callback: IntCallback);

    unsafe fn set_finished_callback(&self, converter: ConverterHandle, callback: IntCallback);

    /// Add a content object; `data` of `None` makes the library load the
    /// object's `page` setting instead
    unsafe fn add_object(&self, converter: ConverterHandle, settings: ObjectSettingsHandle, data: Option<&CStr>);

    /// `wkhtmltopdf_convert`; blocks until the conversion finishes
    unsafe fn convert(&self, converter: ConverterHandle) -> bool;

    unsafe fn current_phase(&self, converter: ConverterHandle) -> i32;

    unsafe fn phase_count(&self, converter: ConverterHandle) -> i32;

    unsafe fn phase_description(&self, converter: ConverterHandle, phase: i32) -> String;

    unsafe fn progress_string(&self, converter: ConverterHandle) -> String;

    unsafe fn http_error_code(&self, converter: ConverterHandle) -> i32;

    /// Copy of the output buffer of the last conversion
    unsafe fn output(&self, converter: ConverterHandle) -> Vec<u8>;
}

/// Produces native library instances for isolation contexts
pub trait LibraryLoader: Send + Sync {
    /// Load a fresh instance of the library at `path`
    fn load(&self, path: &Path) -> Result<Arc<dyn NativeLibrary>>;

    /// Drop one process-level reference to the module at `path`.
    ///
    /// Returns `true` if a reference was released, meaning the module may
    /// still be resident and the caller should try again. Returns `false`
    /// without releasing anything while an instance loaded from `path` is
    /// still alive anywhere in the process.
    fn unlink(&self, path: &Path) -> bool;
}

/// Decode a NUL-terminated buffer filled by the library
pub(crate) fn string_from_buffer(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

/// Decode a C string owned by the library; null reads as empty
///
/// # Safety
///
/// `ptr` must be null or point to a valid NUL-terminated string.
pub(crate) unsafe fn string_from_ptr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
