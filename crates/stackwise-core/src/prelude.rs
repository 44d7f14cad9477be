//! Common module for library exports

pub use crate::capture::{CaptureRequest, CaptureResult, CapturedSlice, StackTracer, Trace};
pub use crate::error::{FailureKind, TraceError, TraceResult};
#[cfg(target_os = "macos")]
pub use crate::platform::macos::MachThreadControl;
pub use crate::registry::{LoadedModule, ModuleDescriptor, ModuleRegistry, ModuleSource};
pub use crate::render::{FormatOptions, Style, TraceFormatter};
pub use crate::symbols::{BuildMode, SymbolResolver};
pub use crate::thread::ThreadControl;
pub use crate::types::{Address, Architecture, StackBounds, StackTraceFrame, ThreadContext};
