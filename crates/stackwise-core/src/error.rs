//! # Error Types
//!
//! Error handling for the capture and symbolication engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! None of these errors escape the capture API: a capture always returns the
//! best trace it could obtain. The errors are used internally (to decide what
//! to cache and when to stop walking) and by the lower-level building blocks
//! that callers may use directly, such as [`crate::registry::ModuleSource`]
//! or [`crate::symbols::ImageReader`].

use thiserror::Error;

/// Main error type for trace operations
///
/// ## Error Categories
///
/// 1. **Module errors**: UnsupportedFormat, CorruptImage, Io
/// 2. **Walk errors**: UnwindFailure
/// 3. **Lookup errors**: SymbolNotFound, LineNotFound
/// 4. **Thread control errors**: SuspendFailed, ResumeFailed
/// 5. **Caller errors**: InvalidArgument
#[derive(Error, Debug)]
pub enum TraceError
{
    /// The module's binary layout is not one we can parse
    ///
    /// The module still resolves to address/module-only frames. The decision
    /// is cached on the module so the header is never re-read.
    #[error("Unsupported object format")]
    UnsupportedFormat,

    /// Stack walking cannot proceed past a frame
    ///
    /// The trace is truncated at the failing frame and flagged incomplete.
    #[error("Unwind failure: {0}")]
    UnwindFailure(String),

    /// No symbol covers the given module offset
    #[error("No symbol at offset 0x{0:x}")]
    SymbolNotFound(u64),

    /// No line-table row covers the given module offset
    #[error("No line information at offset 0x{0:x}")]
    LineNotFound(u64),

    /// The module parsed as a known format but its tables are unusable
    ///
    /// Examples:
    /// - Truncated section data
    /// - Malformed DWARF
    /// - A symbol table with a degenerate number of entries
    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    /// Failed to suspend a foreign thread before reading its stack
    #[error("Failed to suspend thread: {0}")]
    SuspendFailed(String),

    /// Failed to resume a foreign thread after reading its stack
    #[error("Failed to resume thread: {0}")]
    ResumeFailed(String),

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error while reading module data or process metadata
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError
{
    /// Coarse classification used when a failure is cached on a module.
    ///
    /// I/O failures are folded into [`FailureKind::UnsupportedFormat`]: a module
    /// whose file cannot be read is treated exactly like one we cannot parse,
    /// so it is never retried.
    pub fn kind(&self) -> FailureKind
    {
        match self {
            TraceError::UnsupportedFormat | TraceError::Io(_) => FailureKind::UnsupportedFormat,
            TraceError::CorruptImage(_) => FailureKind::CorruptImage,
            TraceError::UnwindFailure(_) => FailureKind::UnwindFailure,
            TraceError::SymbolNotFound(_) => FailureKind::SymbolNotFound,
            TraceError::LineNotFound(_) => FailureKind::LineNotFound,
            TraceError::SuspendFailed(_) | TraceError::ResumeFailed(_) => FailureKind::ThreadControl,
            TraceError::InvalidArgument(_) => FailureKind::InvalidArgument,
        }
    }
}

/// Copyable failure classification, cheap to store in per-module caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind
{
    UnsupportedFormat,
    CorruptImage,
    UnwindFailure,
    SymbolNotFound,
    LineNotFound,
    ThreadControl,
    InvalidArgument,
}

/// Convenience type alias for `Result<T, TraceError>`
///
/// ```rust
/// use stackwise_core::error::TraceResult;
/// fn foo() -> TraceResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type TraceResult<T> = std::result::Result<T, TraceError>;
