//! # Mach Thread Control
//!
//! [`ThreadControl`] for threads of the calling process, using Mach thread
//! ports.
//!
//! On macOS, registers are read using `thread_get_state()` with
//! architecture-specific "flavors":
//!
//! - **ARM64**: `ARM_THREAD_STATE64` (flavor 6)
//! - **x86-64**: `X86_THREAD_STATE64` (flavor 4)
//!
//! The stack window is copied directly: the target thread lives in our own
//! address space and is suspended while the copy is made.

use libc::{c_int, mach_msg_type_number_t, natural_t, thread_act_t};
use mach2::kern_return::KERN_SUCCESS;
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::platform::macos::error::MachError;
use crate::platform::macos::ffi;
use crate::thread::ThreadControl;
use crate::types::{Address, StackBounds, ThreadContext};
use crate::unwind::StackSnapshot;

/// User-space addresses fit in 47 bits; anything above is pointer
/// authentication signature on arm64e.
#[cfg(target_arch = "aarch64")]
const ADDRESS_MASK: u64 = (1 << 47) - 1;

/// A thread of this process, addressed by its Mach port
#[derive(Debug, Clone, Copy)]
pub struct MachThreadControl
{
    port: thread_act_t,
    stack: StackBounds,
}

impl MachThreadControl
{
    /// Control for the pthread `thread`.
    ///
    /// The calling thread itself is refused: suspending it would never
    /// return.
    ///
    /// # Safety
    ///
    /// `thread` must be a live pthread of this process, and must stay alive
    /// for as long as the returned control is used.
    pub unsafe fn for_pthread(thread: libc::pthread_t) -> TraceResult<Self>
    {
        if libc::pthread_equal(thread, libc::pthread_self()) != 0 {
            return Err(TraceError::InvalidArgument("cannot suspend the calling thread".into()));
        }

        let port = libc::pthread_mach_thread_np(thread);
        if port == 0 {
            return Err(TraceError::InvalidArgument("pthread has no Mach thread port".into()));
        }

        let high = libc::pthread_get_stackaddr_np(thread) as u64;
        let size = libc::pthread_get_stacksize_np(thread) as u64;
        let stack = StackBounds::new(Address::from(high.saturating_sub(size)), Address::from(high));
        debug!(port, low = %stack.low, high = %stack.high, "attached to thread");

        Ok(Self { port, stack })
    }

    pub fn port(&self) -> thread_act_t
    {
        self.port
    }
}

impl ThreadControl for MachThreadControl
{
    fn suspend(&self) -> TraceResult<()>
    {
        // SAFETY: the port names a live thread of this process (see `for_pthread`).
        let result = unsafe { ffi::thread_suspend(self.port) };
        if result != KERN_SUCCESS {
            return Err(MachError::from(result).suspend("thread_suspend"));
        }
        Ok(())
    }

    fn context(&self) -> TraceResult<ThreadContext>
    {
        let (pc, sp, fp, lr) = read_thread_registers(self.port)?;
        Ok(ThreadContext {
            pc: Address::from(pc),
            sp: Address::from(sp),
            fp: Address::from(fp),
            lr: lr.map(Address::from),
            stack: self.stack,
        })
    }

    fn read_stack(&self, from: Address, len: usize) -> TraceResult<StackSnapshot>
    {
        if !self.stack.contains(from, 0) {
            return Err(TraceError::InvalidArgument(format!(
                "{from} is outside the thread stack {}..{}",
                self.stack.low, self.stack.high
            )));
        }
        let available = self.stack.high.value() - from.value();
        let len = len.min(usize::try_from(available).unwrap_or(usize::MAX));

        let mut bytes = vec![0u8; len];
        // SAFETY: `[from, from + len)` lies inside the stack of a suspended
        // thread of this process, which stays mapped while it is suspended.
        unsafe {
            std::ptr::copy_nonoverlapping(from.value() as usize as *const u8, bytes.as_mut_ptr(), len);
        }
        Ok(StackSnapshot::new(from, bytes))
    }

    fn resume(&self) -> TraceResult<()>
    {
        // SAFETY: the port names a live thread of this process (see `for_pthread`).
        let result = unsafe { ffi::thread_resume(self.port) };
        if result != KERN_SUCCESS {
            return Err(MachError::from(result).resume());
        }
        Ok(())
    }
}

/// `(pc, sp, fp, lr)` of a suspended ARM64 thread.
///
/// ## Thread State Structure
///
/// macOS stores ARM64 thread state as an array of 68 `u32` values, each
/// 64-bit register split into low/high halves:
///
/// ```text
/// Index 0-28:   X0-X28
/// Index 29:     FP (X29)
/// Index 30:     LR (X30)
/// Index 31:     SP
/// Index 32:     PC
/// Index 33:     CPSR + padding
/// ```
#[cfg(target_arch = "aarch64")]
fn read_thread_registers(port: thread_act_t) -> TraceResult<(u64, u64, u64, Option<u64>)>
{
    const ARM_THREAD_STATE64: c_int = 6;
    const ARM_THREAD_STATE64_COUNT: mach_msg_type_number_t = 68;

    let mut state_words: [natural_t; ARM_THREAD_STATE64_COUNT as usize] = [0; ARM_THREAD_STATE64_COUNT as usize];
    let mut count = ARM_THREAD_STATE64_COUNT;
    // SAFETY: the buffer holds exactly ARM_THREAD_STATE64_COUNT words.
    let result = unsafe { ffi::thread_get_state(port, ARM_THREAD_STATE64, state_words.as_mut_ptr(), &mut count) };
    if result != KERN_SUCCESS {
        return Err(MachError::from(result).suspend("thread_get_state"));
    }

    let read_u64 = |idx: usize| -> u64 { u64::from(state_words[idx * 2]) | (u64::from(state_words[idx * 2 + 1]) << 32) };
    Ok((
        read_u64(32) & ADDRESS_MASK,
        read_u64(31),
        read_u64(29) & ADDRESS_MASK,
        Some(read_u64(30) & ADDRESS_MASK),
    ))
}

/// `(pc, sp, fp, lr)` of a suspended x86-64 thread; there is no link register.
#[cfg(target_arch = "x86_64")]
fn read_thread_registers(port: thread_act_t) -> TraceResult<(u64, u64, u64, Option<u64>)>
{
    #[repr(C)]
    #[derive(Default)]
    struct X86ThreadState64
    {
        rax: u64,
        rbx: u64,
        rcx: u64,
        rdx: u64,
        rdi: u64,
        rsi: u64,
        rbp: u64,
        rsp: u64,
        r8: u64,
        r9: u64,
        r10: u64,
        r11: u64,
        r12: u64,
        r13: u64,
        r14: u64,
        r15: u64,
        rip: u64,
        rflags: u64,
        cs: u64,
        fs: u64,
        gs: u64,
    }

    const X86_THREAD_STATE64: c_int = 4;
    const X86_THREAD_STATE64_COUNT: mach_msg_type_number_t = 42;

    let mut state = X86ThreadState64::default();
    let mut count = X86_THREAD_STATE64_COUNT;
    // SAFETY: X86ThreadState64 is 21 u64 words, i.e. X86_THREAD_STATE64_COUNT natural_t.
    let result = unsafe {
        ffi::thread_get_state(
            port,
            X86_THREAD_STATE64,
            std::ptr::addr_of_mut!(state).cast::<natural_t>(),
            &mut count,
        )
    };
    if result != KERN_SUCCESS {
        return Err(MachError::from(result).suspend("thread_get_state"));
    }

    Ok((state.rip, state.rsp, state.rbp, None))
}
