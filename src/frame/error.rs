//! Error types for the scene frame codec.

use std::io;

/// Errors produced while encoding or decoding a scene frame.
///
/// Every decode error is fatal for the frame: no partially decoded frame is
/// ever returned.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Byte 0 names a layout this codec does not know.
    #[error("unknown frame version {0}")]
    UnknownVersion(u8),

    /// A gesture carries a tag with no known payload layout.
    #[error("unknown gesture tag {0}")]
    UnknownGesture(u8),

    #[error("unknown joint type {0}")]
    UnknownJointType(u8),

    #[error("unknown hand state {0}")]
    UnknownHandState(u8),

    /// The input ended in the middle of a field.
    #[error("frame truncated")]
    Truncated,

    /// Bytes remain after the last body.
    #[error("{0} trailing byte(s) after frame")]
    TrailingBytes(usize),

    /// A collection does not fit its single-byte length prefix.
    #[error("too many {what}: {count} (at most 255)")]
    TooManyEntries { what: &'static str, count: usize },

    /// The output writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
