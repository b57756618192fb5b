//! Error codes and the crate error type.

use std::fmt;
use std::io;

use crate::event::WaitOutcome;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// A raw operating system error number.
///
/// The value is never reinterpreted by this crate. It is always the code that
/// was captured on the calling thread right after the primitive it belongs to
/// returned.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// The operation completed successfully.
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    /// Incorrect function.
    pub const INVALID_FUNCTION: ErrorCode = ErrorCode(1);
    /// The system cannot find the file specified.
    pub const FILE_NOT_FOUND: ErrorCode = ErrorCode(2);
    /// Access is denied.
    pub const ACCESS_DENIED: ErrorCode = ErrorCode(5);
    /// The handle is invalid.
    pub const INVALID_HANDLE: ErrorCode = ErrorCode(6);
    /// A device attached to the system is not functioning.
    pub const GEN_FAILURE: ErrorCode = ErrorCode(31);
    /// The process cannot access the file because it is being used by another process.
    pub const SHARING_VIOLATION: ErrorCode = ErrorCode(32);
    /// The parameter is incorrect.
    pub const INVALID_PARAMETER: ErrorCode = ErrorCode(87);
    /// Cannot create a file when that file already exists.
    pub const ALREADY_EXISTS: ErrorCode = ErrorCode(183);
    /// More data is available.
    pub const MORE_DATA: ErrorCode = ErrorCode(234);
    /// No more data is available.
    pub const NO_MORE_ITEMS: ErrorCode = ErrorCode(259);
    /// The I/O operation has been aborted.
    pub const OPERATION_ABORTED: ErrorCode = ErrorCode(995);
    /// Overlapped I/O event is not in a signaled state.
    pub const IO_INCOMPLETE: ErrorCode = ErrorCode(996);
    /// Overlapped I/O operation is in progress.
    pub const IO_PENDING: ErrorCode = ErrorCode(997);
    /// Element not found.
    pub const NOT_FOUND: ErrorCode = ErrorCode(1168);

    /// The symbolic name of well-known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            ErrorCode::SUCCESS => "ERROR_SUCCESS",
            ErrorCode::INVALID_FUNCTION => "ERROR_INVALID_FUNCTION",
            ErrorCode::FILE_NOT_FOUND => "ERROR_FILE_NOT_FOUND",
            ErrorCode::ACCESS_DENIED => "ERROR_ACCESS_DENIED",
            ErrorCode::INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            ErrorCode::GEN_FAILURE => "ERROR_GEN_FAILURE",
            ErrorCode::SHARING_VIOLATION => "ERROR_SHARING_VIOLATION",
            ErrorCode::INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            ErrorCode::ALREADY_EXISTS => "ERROR_ALREADY_EXISTS",
            ErrorCode::MORE_DATA => "ERROR_MORE_DATA",
            ErrorCode::NO_MORE_ITEMS => "ERROR_NO_MORE_ITEMS",
            ErrorCode::OPERATION_ABORTED => "ERROR_OPERATION_ABORTED",
            ErrorCode::IO_INCOMPLETE => "ERROR_IO_INCOMPLETE",
            ErrorCode::IO_PENDING => "ERROR_IO_PENDING",
            ErrorCode::NOT_FOUND => "ERROR_NOT_FOUND",
            _ => return None,
        };
        Some(name)
    }

    /// Returns `true` for the two codes an overlapped operation reports while
    /// it is still in flight.
    pub fn is_pending(self) -> bool {
        self == ErrorCode::IO_PENDING || self == ErrorCode::IO_INCOMPLETE
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "ErrorCode({})", self.0),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (Error-Code: {})", name, self.0),
            None => write!(f, "Error-Code: {}", self.0),
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> ErrorCode {
        ErrorCode(code)
    }
}

/// Errors reported by the I/O core.
///
/// Every variant that stems from a native call carries the code captured
/// together with that call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be opened.
    #[error("unable to open {path}: {code}")]
    Open {
        /// Path passed to the open call
        path: String,
        /// Captured error
        code: ErrorCode,
    },

    /// The port is held by someone else.
    #[error("port in use ({0})")]
    PortInUse(String),

    /// No device with that name exists.
    #[error("port not found ({0})")]
    PortNotFound(String),

    /// The OS rejected or could not report a line configuration.
    #[error("line configuration failed: {code}")]
    Config {
        /// Captured error
        code: ErrorCode,
    },

    /// A line configuration was rejected before reaching the OS.
    #[error("invalid line configuration: {0}")]
    InvalidConfig(String),

    /// The configuration block holds a value with no typed counterpart.
    #[error("unrecognized {field} value {value} in configuration block")]
    Decode {
        /// Name of the native field
        field: &'static str,
        /// Raw value found
        value: u32,
    },

    /// Submitting or completing a transfer failed.
    #[error("transfer failed: {code}")]
    Transfer {
        /// Captured error
        code: ErrorCode,
    },

    /// A transfer completed with a different count than requested.
    #[error("unexpected number of transferred bytes: {actual}, expected {expected}")]
    ShortTransfer {
        /// Bytes submitted
        expected: u32,
        /// Bytes reported by the OS
        actual: u32,
    },

    /// A wait did not end signaled.
    #[error("wait ended without a signal: {0:?}")]
    Wait(WaitOutcome),

    /// An operation did not complete within its timeout.
    #[error("{operation} timed out after {millis} milliseconds")]
    Timeout {
        /// Name of the operation
        operation: &'static str,
        /// Timeout in milliseconds
        millis: u32,
    },

    /// Releasing a handle failed.
    #[error("close failed: {code}")]
    Close {
        /// Captured error
        code: ErrorCode,
    },

    /// Creating or signaling an event failed.
    #[error("event operation failed: {code}")]
    Event {
        /// Captured error
        code: ErrorCode,
    },

    /// A registry call failed.
    #[error("registry operation failed: {code}")]
    Registry {
        /// Status returned by the registry call
        code: ErrorCode,
    },

    /// Querying or setting communication state failed.
    #[error("communication status call failed: {code}")]
    Comm {
        /// Captured error
        code: ErrorCode,
    },

    /// The port was closed or its pending I/O aborted.
    #[error("port closed: {0}")]
    PortClosed(String),

    /// A port configuration file could not be parsed.
    #[error("configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The native code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match *self {
            Error::Open { code, .. }
            | Error::Config { code }
            | Error::Transfer { code }
            | Error::Close { code }
            | Error::Event { code }
            | Error::Registry { code }
            | Error::Comm { code } => Some(code),
            Error::Wait(WaitOutcome::Failed(code)) => Some(code),
            Error::Io(ref e) => e.raw_os_error().map(|c| ErrorCode(c as u32)),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::Io(e) => return e,
            Error::PortNotFound(_) => io::ErrorKind::NotFound,
            Error::PortInUse(_) => io::ErrorKind::PermissionDenied,
            Error::Open { code, .. } if code == ErrorCode::FILE_NOT_FOUND => {
                io::ErrorKind::NotFound
            }
            Error::Open { code, .. } if code == ErrorCode::ACCESS_DENIED => {
                io::ErrorKind::PermissionDenied
            }
            Error::Timeout { .. } | Error::Wait(WaitOutcome::Timeout) => io::ErrorKind::TimedOut,
            Error::PortClosed(_) => io::ErrorKind::BrokenPipe,
            Error::InvalidConfig(_) | Error::Decode { .. } => io::ErrorKind::InvalidInput,
            Error::ShortTransfer { .. } => io::ErrorKind::WriteZero,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_codes_display_their_name() {
        assert_eq!(
            ErrorCode::FILE_NOT_FOUND.to_string(),
            "ERROR_FILE_NOT_FOUND (Error-Code: 2)"
        );
        assert_eq!(ErrorCode(4242).to_string(), "Error-Code: 4242");
        assert_eq!(format!("{:?}", ErrorCode::IO_PENDING), "ERROR_IO_PENDING(997)");
    }

    #[test]
    fn pending_codes() {
        assert!(ErrorCode::IO_PENDING.is_pending());
        assert!(ErrorCode::IO_INCOMPLETE.is_pending());
        assert!(!ErrorCode::OPERATION_ABORTED.is_pending());
    }

    #[test]
    fn error_exposes_captured_code() {
        let err = Error::Open {
            path: "COM9".into(),
            code: ErrorCode::ACCESS_DENIED,
        };
        assert_eq!(err.code(), Some(ErrorCode::ACCESS_DENIED));
        assert_eq!(Error::PortClosed("gone".into()).code(), None);
        assert_eq!(
            Error::Wait(WaitOutcome::Failed(ErrorCode::INVALID_HANDLE)).code(),
            Some(ErrorCode::INVALID_HANDLE)
        );
    }

    #[test]
    fn io_error_kinds() {
        let err: io::Error = Error::Timeout {
            operation: "write",
            millis: 2000,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = Error::Open {
            path: r"\\.\COM3".into(),
            code: ErrorCode::FILE_NOT_FOUND,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
