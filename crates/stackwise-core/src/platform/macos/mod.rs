//! # macOS Thread Control
//!
//! macOS uses the Mach microkernel; a thread of our own process can be
//! suspended and inspected through its Mach thread port:
//!
//! - `pthread_mach_thread_np()`: pthread handle to thread port (from `libc`)
//! - `thread_suspend()` / `thread_resume()`: stop and restart the thread
//! - `thread_get_state()`: read its registers
//!
//! ## Dependencies
//!
//! We use a hybrid approach:
//! - **mach2 crate**: For well-maintained Mach constants (`KERN_SUCCESS`, ...)
//! - **libc crate**: For type definitions (`thread_act_t`, `natural_t`, ...)
//! - **extern "C"**: For thread functions not in mach2 (`thread_get_state`, ...)
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [thread_get_state(3) man page](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)

pub mod error;
mod ffi;
pub mod thread;

pub use error::MachError;
pub use thread::MachThreadControl;
