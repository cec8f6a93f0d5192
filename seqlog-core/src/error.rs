//! Error types for sequence log operations
//!
//! Every failure the service can observe maps onto one variant here. The
//! collector loop never terminates on any of them; only configuration and
//! startup failures are fatal, and only before the service is running.
//!
//! # Error Codes
//!
//! Each variant has a stable code (e.g. `CHANNEL_FULL`) used in stats and
//! in the JSON error bodies served by the web endpoint.
//!
//! # Example
//!
//! ```rust
//! use seqlog_core::error::{SeqLogError, ErrorCategory};
//!
//! let err = SeqLogError::ChannelFull { capacity: 300 };
//! assert_eq!(err.category(), ErrorCategory::Producer);
//! assert!(err.is_recoverable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Tag;

/// Result type alias for sequence log operations
pub type Result<T> = std::result::Result<T, SeqLogError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Producer-side, non-fatal (full ring, stale handle)
    Producer,
    /// Consumer-side decode failures
    Consumer,
    /// Record sequences that break the step in/out protocol
    Protocol,
    /// Delivery target failures
    Sink,
    /// Buffer ceilings
    Capacity,
    /// Startup configuration
    Config,
    /// I/O
    Internal,
}

/// Errors that can occur in sequence log operations
#[derive(Error, Debug)]
pub enum SeqLogError {
    // ═══════════════════════════════════════════════════════════════════════
    // Producer errors
    // ═══════════════════════════════════════════════════════════════════════

    /// The shared ring has no free slot and the overflow policy rejected the record
    #[error("Channel full: all {capacity} slots are unread. The record was dropped.")]
    ChannelFull { capacity: u32 },

    /// A tag was used after its root frame closed or after the stack moved on
    #[error("Stale tag {tag}: the call stack it named is no longer open.")]
    StaleTag { tag: Tag },

    // ═══════════════════════════════════════════════════════════════════════
    // Consumer errors
    // ═══════════════════════════════════════════════════════════════════════

    /// A slot held bytes that do not decode to a record
    #[error("Corrupt record: {reason}")]
    CorruptRecord { reason: String },

    /// The shared segment does not carry the expected header/layout
    #[error("Channel layout mismatch: {reason}")]
    ChannelLayout { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Unmatched step out, or a nested record for a tag the service does not know
    #[error("Protocol violation on tag {tag}: {reason}")]
    ProtocolViolation { tag: Tag, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Sink and capacity errors
    // ═══════════════════════════════════════════════════════════════════════

    /// One delivery target failed; the others are unaffected
    #[error("Sink '{sink}' unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },

    /// The call-tree buffer exceeded its node ceiling
    #[error("Call-tree buffer exceeded {limit} buffered nodes")]
    CapacityExceeded { limit: usize },

    /// A log segment was asked for that is not (or no longer) retained
    #[error("No log segment named '{name}'")]
    SegmentNotFound { name: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration and infrastructure
    // ═══════════════════════════════════════════════════════════════════════

    /// Configuration is missing, malformed or inconsistent
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeqLogError {
    /// Shorthand for building a `ConfigError`
    pub fn config(reason: impl Into<String>) -> Self {
        SeqLogError::ConfigError { reason: reason.into() }
    }

    /// Shorthand for building a `CorruptRecord`
    pub fn corrupt(reason: impl Into<String>) -> Self {
        SeqLogError::CorruptRecord { reason: reason.into() }
    }

    /// Returns true if a later attempt of the same operation may succeed
    ///
    /// A full ring drains, and a sink that went away may come back.
    /// Decode and protocol errors are properties of the data, not of timing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SeqLogError::ChannelFull { .. }
                | SeqLogError::SinkUnavailable { .. }
                | SeqLogError::CapacityExceeded { .. }
        )
    }

    /// Returns true if this error must stop the service from starting
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            SeqLogError::ConfigError { .. }
                | SeqLogError::ChannelLayout { .. }
                | SeqLogError::Io(_)
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            SeqLogError::ChannelFull { .. } | SeqLogError::StaleTag { .. } => {
                ErrorCategory::Producer
            }

            SeqLogError::CorruptRecord { .. } | SeqLogError::ChannelLayout { .. } => {
                ErrorCategory::Consumer
            }

            SeqLogError::ProtocolViolation { .. } => ErrorCategory::Protocol,

            SeqLogError::SinkUnavailable { .. } | SeqLogError::SegmentNotFound { .. } => {
                ErrorCategory::Sink
            }

            SeqLogError::CapacityExceeded { .. } => ErrorCategory::Capacity,

            SeqLogError::ConfigError { .. } => ErrorCategory::Config,

            SeqLogError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            SeqLogError::ChannelFull { .. } => "CHANNEL_FULL",
            SeqLogError::StaleTag { .. } => "STALE_TAG",
            SeqLogError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SeqLogError::ChannelLayout { .. } => "CHANNEL_LAYOUT",
            SeqLogError::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            SeqLogError::SinkUnavailable { .. } => "SINK_UNAVAILABLE",
            SeqLogError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            SeqLogError::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            SeqLogError::ConfigError { .. } => "CONFIG_ERROR",
            SeqLogError::Io(_) => "IO_ERROR",
        }
    }

    /// Converts this error to a JSON-serializable response object
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

/// JSON-serializable error response for APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "CHANNEL_FULL")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub recoverable: bool,
}
