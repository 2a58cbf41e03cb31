//! Stack-wide error taxonomy
//!
//! Errors are propagated as distinct kinds rather than opaque integers; the
//! `errno()` projection exists for the places that still speak errno: the
//! control-socket `response.error` field and process exit codes.

use thiserror::Error;

/// The error type shared by every layer of the blktap stack
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying file or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch, bad cookie, unsupported version, malformed locator
    #[error("invalid format: {0}")]
    Format(String),

    /// Unexpected message type, truncated frame, framing violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Illegal state transition
    #[error("invalid state: {0}")]
    State(String),

    /// Deadline elapsed with the operation incomplete
    #[error("operation timed out")]
    Timeout,

    /// Transient conflict, retry expected
    #[error("resource busy: {0}")]
    Busy(String),

    /// Config-store key, tapdisk pid, or minor does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-side misuse
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// File extension or write failed with ENOSPC
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// The channel is broken; no further progress without intervention
    #[error("channel broken: {0}")]
    Broken(String),
}

/// Result type alias for blktap operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a format error from a string
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Create a protocol error from a string
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create an invalid-state error
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Error::InvalidArg(msg.into())
    }

    /// Rebuild an error from an errno carried on the wire.
    ///
    /// Inverse of [`errno`](Self::errno) for the codes the protocol uses;
    /// anything unrecognized comes back as `Io`.
    pub fn from_errno(errno: i32, context: &str) -> Self {
        match errno {
            libc::ETIMEDOUT => Error::Timeout,
            libc::EBUSY | libc::EAGAIN => Error::Busy(context.to_string()),
            libc::ENOENT | libc::ESRCH => Error::NotFound(context.to_string()),
            libc::EINVAL => Error::InvalidArg(context.to_string()),
            libc::ENOSPC => Error::OutOfSpace(context.to_string()),
            libc::EPROTO => Error::Protocol(context.to_string()),
            _ => Error::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }

    /// Project the error onto an OS errno value.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Format(_) => libc::EINVAL,
            Error::Protocol(_) => libc::EPROTO,
            Error::State(_) => libc::EINVAL,
            Error::Timeout => libc::ETIMEDOUT,
            Error::Busy(_) => libc::EBUSY,
            Error::NotFound(_) => libc::ENOENT,
            Error::InvalidArg(_) => libc::EINVAL,
            Error::OutOfSpace(_) => libc::ENOSPC,
            Error::Broken(_) => libc::ECONNRESET,
        }
    }

    /// True for transient conditions where a retry is expected to succeed.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Busy(_) => true,
            Error::Io(e) => matches!(
                e.raw_os_error(),
                Some(libc::EBUSY) | Some(libc::EAGAIN)
            ),
            _ => false,
        }
    }
}
