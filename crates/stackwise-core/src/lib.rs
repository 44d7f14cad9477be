//! # stackwise-core
//!
//! Stack trace capture and symbolication for the running process.
//!
//! This crate provides:
//! - `.eh_frame` unwinding with a frame-pointer chain where no CFI covers a frame
//! - A registry of loaded modules (executable and shared libraries)
//! - Lazy, cached, thread-safe symbol and line indexing from ELF, Mach-O and PE images
//! - Rust and C++ demangling
//! - Line-oriented and structured text rendering
//! - A crash-safe capture path that writes into caller-provided buffers
//! - A leak-reporting allocator that remembers where each live block came from
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stackwise_core::{CaptureRequest, FormatOptions, StackTracer, TraceFormatter};
//!
//! let tracer = StackTracer::for_current_process()?;
//! let trace = tracer.capture(&CaptureRequest::new().with_max_frames(32));
//! println!("{}", TraceFormatter::new(FormatOptions::default()).render(&trace));
//! # Ok::<(), stackwise_core::TraceError>(())
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: modules from `/proc/self/maps`
//! - **macOS**: modules from dyld, foreign threads through Mach thread ports
//! - **Windows**: PE images can be symbolized, module enumeration is not provided
//!
//! ## Why unsafe code is needed
//!
//! Walking a stack means reading raw memory at addresses found on that stack,
//! reading registers needs inline assembly, and suspending another thread goes
//! through kernel APIs. These are wrapped in safe abstractions that check
//! bounds and alignment before any read.

#![allow(unsafe_code)] // Required for register capture, stack reads and Mach thread APIs

pub mod allocator;
pub mod capture;
pub mod error;
pub mod format;
pub mod platform;
pub mod prelude;
pub mod registry;
pub mod render;
pub mod symbols;
pub mod thread;
pub mod types;
pub mod unwind;

pub use allocator::TracingAllocator;
pub use capture::{CaptureRequest, CaptureResult, CapturedSlice, CrashReport, StackTracer, Trace};
// Re-export commonly used types
pub use error::{FailureKind, TraceError, TraceResult};
pub use render::{FormatOptions, Style, TraceFormatter, Written};
pub use types::{Address, StackTraceFrame, ThreadContext};
