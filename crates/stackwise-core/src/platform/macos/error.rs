//! # macOS Mach API Errors
//!
//! Mach APIs return `kern_return_t` values, which are integer error codes.
//! This module converts those codes into Rust error types with descriptive
//! messages, and folds them into [`TraceError`] for the thread control path.

use mach2::kern_return::{KERN_FAILURE, KERN_INVALID_ARGUMENT, KERN_PROTECTION_FAILURE, KERN_TERMINATED};
use thiserror::Error;

use crate::error::TraceError;

/// Mach kernel API error
///
/// Common values:
///
/// - `KERN_SUCCESS` (0): Operation succeeded
/// - `KERN_INVALID_ARGUMENT` (4): Invalid thread port or flavor
/// - `KERN_PROTECTION_FAILURE` (5): Permission denied
/// - `KERN_FAILURE` (14): General failure (often means the thread has exited)
/// - `KERN_TERMINATED` (37): The thread is being torn down
///
/// ## References
///
/// - [kern_return_t documentation](https://developer.apple.com/documentation/kernel/kern_return_t)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachError
{
    #[error("KERN_INVALID_ARGUMENT: Invalid thread port or argument")]
    InvalidArgument,

    #[error("KERN_PROTECTION_FAILURE: Permission denied")]
    ProtectionFailure,

    #[error("KERN_FAILURE: Thread not available")]
    Failure,

    #[error("KERN_TERMINATED: Thread terminated")]
    Terminated,

    /// The integer value is preserved so you can look it up.
    #[error("Unknown Mach error: {0}")]
    Unknown(i32),
}

impl From<libc::kern_return_t> for MachError
{
    fn from(code: libc::kern_return_t) -> Self
    {
        match code {
            KERN_INVALID_ARGUMENT => MachError::InvalidArgument,
            KERN_PROTECTION_FAILURE => MachError::ProtectionFailure,
            KERN_FAILURE => MachError::Failure,
            KERN_TERMINATED => MachError::Terminated,
            _ => MachError::Unknown(code),
        }
    }
}

impl MachError
{
    pub(crate) fn suspend(self, call: &str) -> TraceError
    {
        TraceError::SuspendFailed(format!("{call}: {self}"))
    }

    pub(crate) fn resume(self) -> TraceError
    {
        TraceError::ResumeFailed(format!("thread_resume: {self}"))
    }
}
