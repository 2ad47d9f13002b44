//! Driver error types.

use core::fmt;

use crate::resource::IrqError;

/// Errors a bus predicate or driver callback can report.
///
/// This is the *cause* carried by the registry's own error kinds
/// (`ProbeFailed`, `RemoveFailed`, `MatchError`); it is deliberately `Copy`
/// so it can be recorded on a device and reported to several callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The hardware device was not found or did not respond.
    DeviceNotFound,
    /// Driver initialization failed.
    InitFailed,
    /// A memory allocation for driver state failed.
    OutOfMemory,
    /// A required resource is held by someone else.
    Busy,
    /// The device descriptor is missing or has a malformed property.
    InvalidArgument,
    /// A hardware operation timed out.
    Timeout,
    /// The requested operation is not supported by this driver.
    Unsupported,
    /// An I/O error occurred during a hardware operation.
    IoError,
    /// The driver is not in a valid state for this operation.
    InvalidState,
    /// An interrupt line could not be claimed.
    Irq(IrqError),
    /// The driver callback panicked.
    Panicked,
    /// Driver-specific failure with a static description.
    Custom(&'static str),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotFound => f.write_str("device not found"),
            Self::InitFailed => f.write_str("driver initialization failed"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::Busy => f.write_str("resource busy"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::Timeout => f.write_str("hardware operation timed out"),
            Self::Unsupported => f.write_str("operation not supported"),
            Self::IoError => f.write_str("I/O error"),
            Self::InvalidState => f.write_str("invalid driver state"),
            Self::Irq(e) => write!(f, "interrupt claim failed: {e}"),
            Self::Panicked => f.write_str("driver callback panicked"),
            Self::Custom(info) => f.write_str(info),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Irq(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IrqError> for DriverError {
    fn from(e: IrqError) -> Self {
        Self::Irq(e)
    }
}
