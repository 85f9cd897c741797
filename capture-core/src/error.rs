//! Error types for capture engine operations
//!
//! Administrative calls (open, close, watch and trigger configuration,
//! read) report failures synchronously through [`CaptureError`]. The record
//! path never returns an error: a full buffer sets the sticky OVERFLOW flag
//! and a failed control allocation sets NO-MEMORY, both inspectable later
//! through [`crate::CaptureEngine::flags`].
//!
//! Each variant carries:
//! - a stable error code (e.g. `READER_BUSY`) for programmatic handling
//! - an [`ErrorCategory`] for grouping
//! - a classic kernel [`StatusCode`] for monitors that speak status numbers
//!
//! # Example
//!
//! ```rust
//! use capture_core::error::{CaptureError, ErrorCategory, StatusCode};
//!
//! let err = CaptureError::ReaderBusy;
//! assert_eq!(err.category(), ErrorCategory::Concurrency);
//! assert_eq!(err.status_code(), StatusCode::ResourceInUse);
//! assert_eq!(err.error_code(), "READER_BUSY");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reader::WaitError;

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad or conflicting watch/trigger configuration
    Configuration,
    /// Lookup of a name or id matched no control
    NotFound,
    /// Workspace or buffer space ran out
    Exhausted,
    /// Engine state or reader ownership forbids the call
    Concurrency,
    /// The reader's blocking wait failed
    Wait,
    /// Should not happen
    Internal,
}

/// Classic kernel directive status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum StatusCode {
    Successful = 0,
    InvalidName = 3,
    InvalidId = 4,
    TooMany = 5,
    Timeout = 6,
    InvalidSize = 8,
    InvalidNumber = 10,
    ResourceInUse = 12,
    Unsatisfied = 13,
    NotConfigured = 22,
    InternalError = 25,
    NoMemory = 26,
}

impl StatusCode {
    /// Numeric value of the status
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Errors that can occur in capture engine operations
#[derive(Error, Debug)]
pub enum CaptureError {
    // ═══════════════════════════════════════════════════════════════════════
    // Engine state errors
    // ═══════════════════════════════════════════════════════════════════════

    /// `open` called on an engine that is already open
    #[error("Capture engine already open. Close it before opening again.")]
    AlreadyOpen,

    /// Operation requires an open engine
    #[error("Capture engine not open: cannot {operation}. Call open() first.")]
    NotOpen { operation: &'static str },

    /// Operation refused while capture is switched on
    #[error("Cannot {operation} while capture is enabled. Disable capture first.")]
    CaptureEnabled { operation: &'static str },

    /// A reader already holds records, or a flush/close raced a reader
    #[error("Capture reader busy: another task holds an unreleased batch.")]
    ReaderBusy,

    // ═══════════════════════════════════════════════════════════════════════
    // Watch and trigger configuration errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Both name and id are the wildcard
    #[error("Invalid control key: name and id cannot both be zero.")]
    WildcardKey,

    /// A wildcard-id watch for this name already exists
    #[error("Watch for name {name:#010x} with wildcard id already exists.")]
    DuplicateWatch { name: u32 },

    /// The destination control has no free "by" slot
    #[error("Too many from-to triggers: control already holds {max} by-rules.")]
    TooManyByRules { max: usize },

    /// No control matched the name
    #[error("No control matches name {name:#010x}.")]
    NameNotFound { name: u32 },

    /// No control matched the id
    #[error("No control matches id {id:#010x}.")]
    IdNotFound { id: u32 },

    // ═══════════════════════════════════════════════════════════════════════
    // Resource errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocation failed
    #[error("Out of memory allocating {what}.")]
    NoMemory { what: &'static str },

    /// Buffer capacity cannot hold a single record
    #[error("Invalid capture buffer size {size}: must hold at least one record.")]
    InvalidSize { size: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Reader and infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Reader wait failed for a reason other than its timeout
    #[error("Reader wait failed: {0}")]
    Wait(#[from] WaitError),

    /// Configuration document could not be parsed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    InternalError { reason: String },
}

impl CaptureError {
    /// Returns true if retrying later might succeed
    ///
    /// A busy reader eventually releases, enabled capture can be switched
    /// off, and workspace may be freed by deleting watches.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CaptureError::ReaderBusy
                | CaptureError::CaptureEnabled { .. }
                | CaptureError::NoMemory { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::WildcardKey
            | CaptureError::DuplicateWatch { .. }
            | CaptureError::TooManyByRules { .. }
            | CaptureError::InvalidSize { .. }
            | CaptureError::JsonError(_) => ErrorCategory::Configuration,

            CaptureError::NameNotFound { .. } | CaptureError::IdNotFound { .. } => {
                ErrorCategory::NotFound
            }

            CaptureError::NoMemory { .. } => ErrorCategory::Exhausted,

            CaptureError::AlreadyOpen
            | CaptureError::NotOpen { .. }
            | CaptureError::CaptureEnabled { .. }
            | CaptureError::ReaderBusy => ErrorCategory::Concurrency,

            CaptureError::Wait(_) => ErrorCategory::Wait,

            CaptureError::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            CaptureError::AlreadyOpen => "ALREADY_OPEN",
            CaptureError::NotOpen { .. } => "NOT_OPEN",
            CaptureError::CaptureEnabled { .. } => "CAPTURE_ENABLED",
            CaptureError::ReaderBusy => "READER_BUSY",
            CaptureError::WildcardKey => "WILDCARD_KEY",
            CaptureError::DuplicateWatch { .. } => "DUPLICATE_WATCH",
            CaptureError::TooManyByRules { .. } => "TOO_MANY_BY_RULES",
            CaptureError::NameNotFound { .. } => "NAME_NOT_FOUND",
            CaptureError::IdNotFound { .. } => "ID_NOT_FOUND",
            CaptureError::NoMemory { .. } => "NO_MEMORY",
            CaptureError::InvalidSize { .. } => "INVALID_SIZE",
            CaptureError::Wait(_) => "WAIT_FAILED",
            CaptureError::JsonError(_) => "JSON_ERROR",
            CaptureError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns the kernel status code a directive would report
    pub fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::AlreadyOpen | CaptureError::ReaderBusy => StatusCode::ResourceInUse,

            CaptureError::NotOpen { .. } | CaptureError::JsonError(_) => {
                StatusCode::NotConfigured
            }

            CaptureError::CaptureEnabled { .. } | CaptureError::WildcardKey => {
                StatusCode::Unsatisfied
            }

            CaptureError::DuplicateWatch { .. } | CaptureError::TooManyByRules { .. } => {
                StatusCode::TooMany
            }

            CaptureError::NameNotFound { .. } => StatusCode::InvalidName,
            CaptureError::IdNotFound { .. } => StatusCode::InvalidId,
            CaptureError::NoMemory { .. } => StatusCode::NoMemory,
            CaptureError::InvalidSize { .. } => StatusCode::InvalidSize,

            CaptureError::Wait(WaitError::Timeout) => StatusCode::Timeout,
            CaptureError::Wait(WaitError::Disconnected) | CaptureError::InternalError { .. } => {
                StatusCode::InternalError
            }
        }
    }

    /// Converts this error to a JSON-serializable response object
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                status: self.status_code(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

/// JSON-serializable error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "READER_BUSY")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Kernel status code
    pub status: StatusCode,
    /// Whether retry might succeed
    pub recoverable: bool,
}
