//! Error taxonomy shared by the client and server, and its mapping onto the
//! 32-bit error codes carried on the wire.
#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
use std::error::Error;
use std::fmt;
use std::io;

use color_eyre::Report;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Closed set of error categories the engine distinguishes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-sequence wire data; always fatal to the connection.
    Protocol,
    /// The peer does not implement an optional feature.
    Unsupported,
    /// A referenced export, bitmap or meta context does not exist.
    NotFound,
    /// Read-only, TLS-required or inactive-export violation.
    PermissionDenied,
    /// Malformed request parameters.
    InvalidArgument,
    /// Out of space on the export or the backing store.
    NoSpace,
    /// Allocation failure.
    OutOfMemory,
    /// Size or offset overflow.
    Overflow,
    /// The server is tearing down the export or connection.
    ShuttingDown,
    /// Generic backing-store failure.
    Io,
}

impl ErrorKind {
    /// Classify an error reported by a backing store or transport.
    pub fn from_io(err: &io::Error) -> Self {
        use io::ErrorKind as K;
        match err.kind() {
            K::PermissionDenied | K::ReadOnlyFilesystem => Self::PermissionDenied,
            K::StorageFull | K::FileTooLarge => Self::NoSpace,
            K::OutOfMemory => Self::OutOfMemory,
            K::Unsupported => Self::Unsupported,
            K::NotFound => Self::NotFound,
            K::InvalidInput => Self::InvalidArgument,
            // short read from a truncated backing file or a closed transport
            K::UnexpectedEof => Self::Io,
            kind => {
                warn!("unexpected error {}", kind);
                Self::Io
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Unsupported => "not supported",
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NoSpace => "no space left",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Overflow => "value too large",
            ErrorKind::ShuttingDown => "shutting down",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(s)
    }
}

/// An error of a known [`ErrorKind`], with a message suitable for the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdError {
    kind: ErrorKind,
    msg: String,
}

impl NbdError {
    /// Create an error of the given kind.
    pub fn new<S: AsRef<str>>(kind: ErrorKind, msg: S) -> Self {
        NbdError {
            kind,
            msg: msg.as_ref().to_string(),
        }
    }

    /// Shorthand for a [`ErrorKind::Protocol`] error.
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    /// Shorthand for a [`ErrorKind::InvalidArgument`] error.
    pub fn invalid<S: AsRef<str>>(msg: S) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    /// Wrap a backing-store error, keeping its message.
    pub fn from_io(err: &io::Error) -> Self {
        Self::new(ErrorKind::from_io(err), err.to_string())
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for NbdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd {}: {}", self.kind, self.msg)?;
        Ok(())
    }
}

impl Error for NbdError {}

/// Find the [`ErrorKind`] behind a report, looking through wrapped context.
///
/// Transport failures (`std::io::Error`) are classified with
/// [`ErrorKind::from_io`].
pub fn error_kind(err: &Report) -> Option<ErrorKind> {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<NbdError>() {
            return Some(err.kind());
        }
        if let Some(err) = cause.downcast_ref::<io::Error>() {
            return Some(ErrorKind::from_io(err));
        }
    }
    None
}

/// Error codes as they appear in simple replies and error chunks.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum WireError {
    /// NBD_SUCCESS
    OK = 0,
    /// NBD_EPERM
    EPERM = 1,
    /// NBD_EIO
    EIO = 5,
    /// NBD_ENOMEM
    ENOMEM = 12,
    /// NBD_EINVAL
    EINVAL = 22,
    /// NBD_ENOSPC
    ENOSPC = 28,
    /// NBD_EOVERFLOW
    EOVERFLOW = 75,
    /// NBD_ENOTSUP
    ENOTSUP = 95,
    /// NBD_ESHUTDOWN
    ESHUTDOWN = 108,
}

impl WireError {
    /// Name used in traces.
    pub fn name(self) -> &'static str {
        match self {
            WireError::OK => "success",
            WireError::EPERM => "EPERM",
            WireError::EIO => "EIO",
            WireError::ENOMEM => "ENOMEM",
            WireError::EINVAL => "EINVAL",
            WireError::ENOSPC => "ENOSPC",
            WireError::EOVERFLOW => "EOVERFLOW",
            WireError::ENOTSUP => "ENOTSUP",
            WireError::ESHUTDOWN => "ESHUTDOWN",
        }
    }

    /// Decode a wire code into a local error kind (`None` for success).
    ///
    /// Unknown codes are traced and treated as invalid-argument errors.
    pub fn to_kind(code: u32) -> Option<ErrorKind> {
        let err = match WireError::try_from(code) {
            Ok(err) => err,
            Err(_) => {
                warn!("server sent unknown error code {code}, treating as EINVAL");
                return Some(ErrorKind::InvalidArgument);
            }
        };
        Some(match err {
            WireError::OK => return None,
            WireError::EPERM => ErrorKind::PermissionDenied,
            WireError::EIO => ErrorKind::Io,
            WireError::ENOMEM => ErrorKind::OutOfMemory,
            WireError::EINVAL => ErrorKind::InvalidArgument,
            WireError::ENOSPC => ErrorKind::NoSpace,
            WireError::EOVERFLOW => ErrorKind::Overflow,
            WireError::ENOTSUP => ErrorKind::Unsupported,
            WireError::ESHUTDOWN => ErrorKind::ShuttingDown,
        })
    }
}

impl From<ErrorKind> for WireError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => WireError::EPERM,
            ErrorKind::Io => WireError::EIO,
            ErrorKind::OutOfMemory => WireError::ENOMEM,
            ErrorKind::NoSpace => WireError::ENOSPC,
            ErrorKind::Overflow => WireError::EOVERFLOW,
            ErrorKind::Unsupported => WireError::ENOTSUP,
            ErrorKind::ShuttingDown => WireError::ESHUTDOWN,
            ErrorKind::Protocol | ErrorKind::NotFound | ErrorKind::InvalidArgument => {
                WireError::EINVAL
            }
        }
    }
}
