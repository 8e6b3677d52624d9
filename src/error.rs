//! Error types for accelr

use crate::memory::BackendKind;
use thiserror::Error;

/// Result type alias using accelr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in accelr operations
///
/// The set is deliberately small and closed. Host-side validation failures
/// surface synchronously from the call that detected them; device-side
/// execution failures surface only when a completion token or a stream-wide
/// `wait()` is observed.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Feature combination intentionally unsupported by this layer
    #[error("Not implemented: {feature}")]
    Unimplemented {
        /// Description of the unimplemented feature
        feature: &'static str,
    },

    /// Kernel argument binding received a scalar of unexpected byte size
    ///
    /// The binding protocol recognizes exactly four widths: 1, 2, 4 and
    /// 8 bytes.
    #[error("Unsupported kernel argument width: {width} bytes")]
    UnsupportedArgumentWidth {
        /// The rejected scalar width in bytes
        width: usize,
    },

    /// API misuse mixing buffer and unified-address accessors
    #[error("Wrong backend kind: expected {expected:?}, got {got:?}")]
    WrongBackendKind {
        /// The backing kind the accessor requires
        expected: BackendKind,
        /// The backing kind the handle actually carries
        got: BackendKind,
    },

    /// Out of device memory
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Device or runtime failure surfaced opaquely
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// CUDA driver error
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an unimplemented error
    pub fn unimplemented(feature: &'static str) -> Self {
        Self::Unimplemented { feature }
    }
}
