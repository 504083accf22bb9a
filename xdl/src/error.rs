// SPDX-License-Identifier: BSD-3-Clause
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures at the transport layer (USB, serial, block device).
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("device not found")]
    NotFound,

    #[error("device is busy (claimed by another process?)")]
    Busy,

    #[error("access to the device was denied")]
    AccessDenied,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the device side closed the channel")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out during {phase} after {elapsed:?}")]
    Timeout { phase: String, elapsed: Duration },
}

/// Failures in byte-level framing (HDLC and the MTK length-prefixed envelope).
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("malformed frame")]
    BadFrame,

    #[error("frame checksum mismatch (got {got:#06x}, computed {computed:#06x})")]
    BadChecksum { got: u16, computed: u16 },

    #[error("frame truncated mid-body")]
    Truncated,

    #[error("frame exceeds the {limit} byte limit")]
    Oversize { limit: usize },
}

/// Failures in a vendor protocol exchange.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unexpected response during {phase}: {detail}")]
    UnexpectedResponse { phase: String, detail: String },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("device speaks unsupported protocol version {device_version}")]
    VersionUnsupported { device_version: u32 },

    #[error("device rejected the command: {device_msg}")]
    CommandRejected { device_msg: String },

    #[error("data phase length mismatch (expected {expected}, device consumed {actual})")]
    DataPhaseMismatch { expected: u64, actual: u64 },
}

/// Failures while interpreting partition images and tables.
#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("not an Android sparse image (bad magic {0:#010x})")]
    BadSparseMagic(u32),

    #[error("inconsistent sparse chunks: {0}")]
    InconsistentChunks(String),

    #[error("partition {name} is too small for the image ({image_size} > {partition_size} bytes)")]
    PartitionTooSmall {
        name: String,
        image_size: u64,
        partition_size: u64,
    },

    #[error("image size {0} is not aligned to the storage block size")]
    UnalignedSize(u64),
}

/// Trust and signature constraints reported by the device.
#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
    #[error("device rejected the loader (status {status:#x})")]
    LoaderRejected { status: u32 },

    #[error("device requires a signed payload for {0}")]
    SignatureRequired(String),

    #[error("device is locked: {0}")]
    DeviceLocked(String),
}

/// The error surface shared by every engine in this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected (run connect first)")]
    NotConnected,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(e))
    }
}

impl Error {
    /// Whether a bounded retry of the failed step is worthwhile.
    ///
    /// Only transport-level hiccups during handshakes qualify; device-side
    /// rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Io(_) | TransportError::Timeout { .. })
                | Error::Frame(FrameError::BadChecksum { .. })
        )
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::NotFound,
            rusb::Error::Busy => TransportError::Busy,
            rusb::Error::Access => TransportError::AccessDenied,
            rusb::Error::Pipe | rusb::Error::Interrupted => TransportError::Closed,
            other => TransportError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::Transport(e.into())
    }
}
