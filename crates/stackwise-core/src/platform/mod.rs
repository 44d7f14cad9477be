//! # Platform-Specific Implementations
//!
//! Platform code behind the engine's collaborator traits:
//!
//! - **macOS**: [`crate::thread::ThreadControl`] over Mach thread ports
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - **Linux**: module enumeration lives in [`crate::registry::ProcMaps`];
//!   foreign-thread suspension is not provided
//!
//! Register capture for the current thread is inline assembly in
//! [`crate::types::ThreadContext`] and needs no platform module.

#[cfg(target_os = "macos")]
pub mod macos;
