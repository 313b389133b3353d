//! Unified error types for coffer.
//!
//! All errors are represented by [`CofferError`], using `thiserror` for
//! ergonomic error definitions. Fallible operations return
//! `Result<T, CofferError>`.

use std::fmt;

use thiserror::Error;

/// Which end of a byte transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    /// Reading the input stream failed (the caller's data, or the stored object on `get`).
    Source,
    /// Writing the output stream failed (the caller's sink on `get`).
    Sink,
}

impl fmt::Display for TransferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// The unified error type for all coffer operations.
#[derive(Error, Debug)]
pub enum CofferError {
    /// The requested row or stored object does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// The uri, id, or storage id that was not found.
        key: String,
    },

    /// The computed content checksum differs from the one the caller supplied.
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// The checksum supplied by the caller.
        expected: String,
        /// The checksum computed over the received bytes.
        actual: String,
    },

    /// The number of bytes received differs from the length the caller supplied.
    #[error("Length mismatch: expected {expected} bytes, received {actual}")]
    LengthMismatch {
        /// The length supplied by the caller.
        expected: u64,
        /// The number of bytes received.
        actual: u64,
    },

    /// A byte transfer failed on one side of the copy.
    #[error("Transfer failed ({side}): {message}")]
    Transfer {
        /// The side of the transfer that failed.
        side: TransferSide,
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backing metadata or byte store is unreachable or misconfigured.
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the connectivity or configuration problem.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An internal invariant was violated (e.g. a content-address collision).
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// An I/O operation inside the store failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A caller-supplied value failed validation.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected value.
        message: String,
    },

    /// An unsupported operation was attempted.
    #[error("Unsupported: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl CofferError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store-unavailable error from a message and source error.
    pub fn unavailable(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a source-side transfer error.
    pub fn source_side(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transfer {
            side: TransferSide::Source,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a sink-side transfer error.
    pub fn sink_side(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transfer {
            side: TransferSide::Sink,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only I/O and transfer failures qualify. Validation failures, missing
    /// objects, unavailable stores and invariant violations are reported,
    /// not retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Transfer { .. })
    }

    /// Whether this is a transfer failure on the given side.
    pub fn is_transfer(&self, side: TransferSide) -> bool {
        matches!(self, Self::Transfer { side: s, .. } if *s == side)
    }
}
