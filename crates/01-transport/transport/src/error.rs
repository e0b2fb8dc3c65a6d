//! Error handling helpers for the transport crate.
//!
//! The surface stays small: capacity validation, allocation and mapping
//! failures, layout checks on attach, framing limits and peer close.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Debug)]
/// Errors surfaced by low-level transport helpers.
pub enum TransportError {
    /// Requested ring capacity or buffer size is below the minimum or not properly aligned.
    InvalidCapacity { requested: usize, minimum: usize },
    /// Allocation of a shared region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
    /// Creating, opening, or mapping a named region failed.
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    /// An attached region does not carry the expected layout.
    LayoutMismatch { reason: String },
    /// Ring bookkeeping points outside the data area.
    Corrupt { offset: usize, reason: &'static str },
    /// A frame length exceeds the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// The peer closed the ring.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidCapacity { requested, minimum } => {
                write!(
                    f,
                    "ring capacity {requested} must be at least {minimum} bytes and 8-byte aligned"
                )
            }
            TransportError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate shared region of {size} bytes aligned to {alignment}"
                )
            }
            TransportError::Io { op, path, source } => {
                write!(f, "failed to {op} {}: {source}", path.display())
            }
            TransportError::LayoutMismatch { reason } => {
                write!(f, "shared region layout mismatch: {reason}")
            }
            TransportError::Corrupt { offset, reason } => {
                write!(f, "ring corrupt at offset {offset}: {reason}")
            }
            TransportError::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds limit of {max} bytes")
            }
            TransportError::Closed => f.write_str("ring closed by peer"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
