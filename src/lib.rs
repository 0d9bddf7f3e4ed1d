//! wkbridge
//!
//! Thread-confined bindings for the wkhtmltox HTML-to-PDF library.
//!
//! wkhtmltox is not thread-safe, must be driven from the thread that
//! initialized it, and leaks state between conversions. This crate loads it
//! into an isolation context with a dedicated worker thread, serializes every
//! native call onto that thread, and can unload the library once the last
//! converter is gone.
//!
//! # Modules
//!
//! - `dispatch`: single-thread executor that confines native calls
//! - `isolation`: loads, initializes and tears down the library
//! - `converter`: one native conversion at a time, with event callbacks
//! - `proxy`: thread-safe client handle ([`PdfConverter`])
//! - `native`: the C ABI behind a trait, loaded with `libloading`
//! - `settings`, `events`, `config`, `error`
//!
//! # Example
//!
//! ```no_run
//! use wkbridge::{GlobalSettings, IsolationManager};
//!
//! # fn main() -> wkbridge::Result<()> {
//! let manager = IsolationManager::global();
//! let converter = manager.create(GlobalSettings::default())?;
//! converter.on_progress_changed(|_, progress, _| println!("{}%", progress));
//!
//! if let Some(pdf) = converter.convert_html("<h1>Hello</h1>")? {
//!     std::fs::write("hello.pdf", pdf).ok();
//! }
//! converter.dispose()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod converter;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod isolation;
pub mod native;
pub mod proxy;
pub mod settings;

pub use config::RuntimeConfig;
pub use converter::{ConversionState, Content, Converter, ConverterId};
pub use dispatch::{DispatchError, Dispatcher};
pub use error::{Error, Result};
pub use events::{ConverterEvent, EventHub, SubscriptionId};
pub use isolation::{IsolationContext, IsolationManager};
pub use proxy::PdfConverter;
pub use settings::{ErrorHandling, GlobalSettings, HeaderSettings, ObjectSettings, OutputFormat, PaperSize};
