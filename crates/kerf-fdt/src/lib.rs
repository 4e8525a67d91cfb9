//! FDT codec for the three device-tree dialects exchanged with the
//! multikernel host: *baseline* (hardware inventory only), *state*
//! (baseline merged with every applied overlay, inspection only), and
//! *overlay* (instance create/update/remove deltas).
//!
//! The reader in [`raw`] walks a blob's structure block into an owned tree
//! of [`raw::RawNode`]s; the writer in [`writer`] builds a structure block
//! directly from a closure-driven node builder. [`common`] holds the
//! encode/decode logic shared by every dialect (the hardware inventory
//! section, and the per-instance resource section used by both the state
//! dialect's `instances` node and an overlay fragment's `instance-create`
//! node). The three `*_dialect` modules wire those pieces together behind
//! one `decode_*`/`encode_*` entrypoint apiece.

pub mod baseline;
mod common;
pub mod overlay;
pub mod raw;
pub mod state;
pub mod writer;

pub use raw::{MemReservation, RawFdt, RawFdtError, RawNode};

/// A device tree blob failed to decode: wrong magic, truncated structure
/// block, or a missing mandatory property.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// The structure block itself is malformed (bad magic, truncated,
    /// unsupported version, broken token stream).
    #[error(transparent)]
    Raw(#[from] RawFdtError),
    /// The structure block parsed fine but a dialect-specific node or
    /// property it requires was missing or had the wrong shape.
    #[error("{0}")]
    Shape(String),
}

pub(crate) fn decode_err(message: impl Into<String>) -> DecodeError {
    DecodeError::Shape(message.into())
}

impl From<DecodeError> for kerf_model::KerfError {
    fn from(err: DecodeError) -> Self {
        kerf_model::KerfError::Parse(err.to_string())
    }
}

/// `compatible` string identifying a baseline hardware-inventory blob.
pub const COMPATIBLE_BASELINE: &str = "linux,multikernel-host";
/// `compatible` string identifying a merged current-state blob.
pub const COMPATIBLE_STATE: &str = "linux,multikernel-state";
/// `compatible` string identifying an overlay fragment blob.
pub const COMPATIBLE_OVERLAY: &str = "linux,multikernel-overlay";
