//! # macOS Mach API FFI Declarations
//!
//! Thread control functions that are not provided by the `mach2` crate.
//!
//! All functions here are `unsafe`: they take raw thread ports and raw state
//! buffers whose size must match the requested flavor. They are wrapped by
//! [`super::thread::MachThreadControl`].
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [Mach System Calls](https://developer.apple.com/documentation/kernel)

// Allow doc comments in extern blocks - they're useful for developers even if rustdoc doesn't generate docs
#![allow(unused_doc_comments)]

use libc::{c_int, kern_return_t, mach_msg_type_number_t, natural_t, thread_act_t};

#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Read thread state (registers) from a thread
    ///
    /// - `ARM_THREAD_STATE64` (6): ARM64 registers, 68 words
    /// - `X86_THREAD_STATE64` (4): x86-64 registers, 42 words
    ///
    /// `old_state_count` is the buffer size in `natural_t` words on input and
    /// the number of words written on output.
    ///
    /// See: [thread_get_state(3) man page](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)
    pub fn thread_get_state(
        target_act: thread_act_t,
        flavor: c_int,
        old_state: *mut natural_t,
        old_state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Suspend a specific thread
    ///
    /// Suspensions nest: a thread runs again only after as many
    /// `thread_resume` calls as it received `thread_suspend` calls.
    ///
    /// See: [thread_suspend(3) man page](https://developer.apple.com/documentation/kernel/1402804-thread_suspend/)
    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    /// Resume a specific thread
    ///
    /// See: [thread_resume(3) man page](https://developer.apple.com/documentation/kernel/1402805-thread_resume/)
    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;
}
