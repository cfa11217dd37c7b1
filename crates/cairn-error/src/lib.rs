use cairn_types::{ExtentId, TxnId, VersionId};
use thiserror::Error;

/// Primary error type for the CairnStore locking/versioning/messaging core.
///
/// The taxonomy separates three retry domains: lock errors are decided by the
/// transaction layer (retry vs. abort), transport errors are handled by
/// closing and discarding the connection, and protocol errors (`Underflow`,
/// `FrameDesync`) indicate a bug or a corrupted peer and are never retried on
/// the same stream.
#[derive(Error, Debug)]
pub enum CairnError {
    // === Lock errors ===
    /// The named lock object could not be attached. Fatal to the calling
    /// process: there is no safe fallback when mutual exclusion is gone.
    #[error("cannot attach named lock '{name}'")]
    LockUnavailable { name: String },

    /// Timed out waiting for a named lock. Retryable at the transaction
    /// layer.
    #[error("timed out after {waited_ms}ms waiting for lock '{name}'")]
    LockTimeout { name: String, waited_ms: u64 },

    /// Another transaction holds the write intent on this extent.
    #[error("extent {extent} is busy: provisional write owned by {holder}")]
    ExtentBusy { extent: ExtentId, holder: TxnId },

    // === Versioning errors ===
    /// Operation applied to a transaction in the wrong state (e.g. commit
    /// without begin).
    #[error("invalid transaction state")]
    InvalidTransactionState,

    /// The extent's committed version does not match what the caller staged.
    #[error("version mismatch on {extent}: expected {expected}, found {actual}")]
    VersionMismatch {
        extent: ExtentId,
        expected: VersionId,
        actual: VersionId,
    },

    /// Unknown extent id.
    #[error("no such extent: {0}")]
    NoSuchExtent(ExtentId),

    // === Transport errors ===
    /// A ByteStream read ran past the written length. Always a programming
    /// or protocol bug; abort the message, do not partially recover.
    #[error("byte stream underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },

    /// The peer closed the connection gracefully. Never retried on the same
    /// object; the caller reconnects if it wants to continue.
    #[error("socket closed by peer")]
    SocketClosed,

    /// An errno-carrying I/O failure. The owning connection must be closed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decompression failed or the decompressed length did not match the
    /// frame header. The message is corrupt; discard the connection.
    #[error("compression failure: {detail}")]
    CompressionFailure { detail: String },

    /// The reader lost framing and exhausted its resync scan without
    /// finding a magic. The stream is not speaking the protocol; discard
    /// the connection.
    #[error("frame desync: no magic within {skipped} scanned bytes")]
    FrameDesync { skipped: usize },

    /// A frame declared a payload larger than the configured cap.
    #[error("frame payload of {len} bytes exceeds cap of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    // === Pool errors ===
    /// No connection could be established to the endpoint.
    #[error("cannot reach endpoint '{endpoint}'")]
    EndpointUnreachable { endpoint: String },

    /// Failure reported by the remote write engine; only the text survives
    /// the wire when no richer status applies.
    #[error("remote engine error: {detail}")]
    Remote { detail: String },

    // === Internal ===
    /// Internal invariant violation (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Out-of-band status byte carried on every RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// Operation applied.
    Ok = 0,
    /// Generic failure; see the textual detail in the response payload.
    Error = 1,
    /// Lock acquisition timed out; the caller may retry the transaction.
    LockTimeout = 2,
    /// Extent held provisionally by another transaction.
    ExtentBusy = 3,
    /// Request payload was truncated or malformed.
    Underflow = 4,
    /// Referenced extent/transaction does not exist.
    NotFound = 5,
    /// Server-side invariant violation.
    Internal = 6,
}

impl StatusCode {
    /// Wire discriminant value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse wire discriminant; `None` for unknown codes.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::LockTimeout),
            3 => Some(Self::ExtentBusy),
            4 => Some(Self::Underflow),
            5 => Some(Self::NotFound),
            6 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl CairnError {
    /// Whether a retry (with a fresh transaction attempt or a fresh
    /// connection) may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::ExtentBusy { .. } | Self::SocketClosed
        )
    }

    /// Whether the calling process cannot safely continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LockUnavailable { .. })
    }

    /// Map to the wire status byte for an RPC response.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::LockTimeout { .. } => StatusCode::LockTimeout,
            Self::ExtentBusy { .. } => StatusCode::ExtentBusy,
            Self::Underflow { .. } => StatusCode::Underflow,
            Self::NoSuchExtent(_) => StatusCode::NotFound,
            Self::Internal(_) => StatusCode::Internal,
            Self::LockUnavailable { .. }
            | Self::Remote { .. }
            | Self::InvalidTransactionState
            | Self::VersionMismatch { .. }
            | Self::SocketClosed
            | Self::Io(_)
            | Self::CompressionFailure { .. }
            | Self::FrameDesync { .. }
            | Self::PayloadTooLarge { .. }
            | Self::EndpointUnreachable { .. } => StatusCode::Error,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a compression failure.
    pub fn compression(detail: impl Into<String>) -> Self {
        Self::CompressionFailure {
            detail: detail.into(),
        }
    }

    /// Create a lock-unavailable error for a named lock.
    pub fn lock_unavailable(name: impl Into<String>) -> Self {
        Self::LockUnavailable { name: name.into() }
    }
}

/// Result type alias using `CairnError`.
pub type Result<T> = std::result::Result<T, CairnError>;
