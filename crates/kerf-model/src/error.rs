//! The error type shared across every `kerf` crate.

/// Errors returned from resource-model, codec, validation, and runtime
/// operations.
///
/// Each variant corresponds to one of the failure categories operators need
/// to tell apart at the CLI boundary (see [`KerfError::exit_code`]).
#[derive(Debug, thiserror::Error)]
pub enum KerfError {
    /// A hard validation invariant was violated (not a soft warning).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A device tree blob or textual spec could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The requested resources overlap with resources already assigned.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// The requested resources exceed what remains in the available pool.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// A reference to an instance, device, or NUMA node does not resolve.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// An operation against the kernel pseudo-filesystem or a syscall failed.
    #[error("kernel interface error ({errno}: {symbol}): {context}")]
    KernelInterface {
        /// The raw `errno` value, when one is available.
        errno: i32,
        /// The symbolic errno name (`EBUSY`, `EPERM`, ...), for readability.
        symbol: &'static str,
        /// What the caller was trying to do when the call failed.
        context: String,
        /// The underlying I/O error, if the failure came through `std::io`.
        #[source]
        source: Option<std::io::Error>,
    },
}

impl KerfError {
    /// Builds a [`KerfError::KernelInterface`] from an `errno` value and a
    /// description of the failing operation.
    #[must_use]
    pub fn kernel_interface(errno: i32, context: impl Into<String>) -> Self {
        Self::KernelInterface {
            errno,
            symbol: errno_symbol(errno),
            context: context.into(),
            source: None,
        }
    }

    /// Builds a [`KerfError::KernelInterface`] wrapping an [`std::io::Error`].
    #[must_use]
    pub fn from_io(err: std::io::Error, context: impl Into<String>) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        Self::KernelInterface {
            errno,
            symbol: errno_symbol(errno),
            context: context.into(),
            source: Some(err),
        }
    }

    /// The stable process exit code for this error category, per the
    /// documented `kerf` exit code contract: 0 success, 1 validation failed
    /// or runtime error, 2 argument error (produced by `clap` itself, not
    /// this enum), 3 file-I/O error, 4 FDT parse error, 130 interrupted.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_)
            | Self::ResourceConflict(_)
            | Self::ResourceExhaustion(_)
            | Self::InvalidReference(_) => 1,
            Self::KernelInterface { .. } => 3,
            Self::Parse(_) => 4,
        }
    }
}

/// Maps a handful of common `errno` values to their symbolic name. Anything
/// unrecognized falls back to a generic label rather than failing.
fn errno_symbol(errno: i32) -> &'static str {
    match errno {
        1 => "EPERM",
        2 => "ENOENT",
        5 => "EIO",
        9 => "EBADF",
        12 => "ENOMEM",
        13 => "EACCES",
        16 => "EBUSY",
        17 => "EEXIST",
        22 => "EINVAL",
        28 => "ENOSPC",
        30 => "EROFS",
        _ => "UNKNOWN",
    }
}

/// A `Result` defaulting its error type to [`KerfError`].
pub type Result<T> = std::result::Result<T, KerfError>;
