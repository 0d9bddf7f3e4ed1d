//! Error types for wkbridge

use thiserror::Error;

use crate::dispatch::DispatchError;

/// Result type alias for converter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// A runtime toggle was changed while an isolation context is alive
    #[error("Isolation context already loaded; cannot change {setting} setting")]
    ContextAlive { setting: &'static str },

    /// The converter (or its remote counterpart) was already disposed
    #[error("Cannot perform operation; converter is disposed")]
    Disposed,

    /// A conversion is already running on this converter
    #[error("Converter is busy with another conversion")]
    Busy,

    /// A read-through query was made before any conversion attempt
    #[error("No conversion has been attempted on this converter yet")]
    NoConversion,

    /// Content cannot be handed to the native library
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// The isolation context was torn down while the call was in flight
    #[error("Isolation context has been torn down")]
    ContextClosed,

    /// The native module could not be loaded or is missing a symbol
    #[error("Failed to load native library: {0}")]
    Load(String),

    /// The native library refused an operation
    #[error("Native library error: {0}")]
    Native(String),

    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The confinement dispatcher could not run the call
    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl From<libloading::Error> for Error {
    fn from(err: libloading::Error) -> Self {
        Error::Load(err.to_string())
    }
}
