//! Register snapshot and stack range used as the starting point of a walk.
//!
//! ## Capturing the calling point
//!
//! [`ThreadContext::current`] reads the program counter, stack pointer, frame
//! pointer (and link register on AArch64) with a few instructions of inline
//! assembly. It is `#[inline(always)]`, so the registers describe the frame of
//! the function that called it, which stays live for the whole walk.
//!
//! ## Stack bounds
//!
//! The walker refuses to read outside `[low, high)`. Bounds for the current
//! thread come from pthreads:
//!
//! - **Linux**: `pthread_getattr_np` + `pthread_attr_getstack`
//! - **macOS**: `pthread_get_stackaddr_np` (top of stack) + `pthread_get_stacksize_np`
//!
//! The query is cached per thread. glibc may allocate while answering it for
//! the main thread, so code that later captures from a signal handler should
//! warm the cache first (see `StackTracer::prepare`).

use std::cell::Cell;

use super::Address;

/// Half-open address range `[low, high)` occupied by a thread's stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds
{
    pub low: Address,
    pub high: Address,
}

impl StackBounds
{
    pub const fn new(low: Address, high: Address) -> Self
    {
        Self { low, high }
    }

    /// An empty range anchored at `at`; every read against it fails.
    pub const fn empty_at(at: Address) -> Self
    {
        Self { low: at, high: at }
    }

    /// Size of the range in bytes.
    pub fn len(&self) -> u64
    {
        self.high.value().saturating_sub(self.low.value())
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// Whether `len` bytes starting at `address` lie entirely inside the range.
    ///
    /// ```rust
    /// use stackwise_core::types::{Address, StackBounds};
    ///
    /// let bounds = StackBounds::new(Address::from(0x1000), Address::from(0x2000));
    /// assert!(bounds.contains(Address::from(0x1ff8), 8));
    /// assert!(!bounds.contains(Address::from(0x1ffc), 8));
    /// assert!(!bounds.contains(Address::from(0x0ff8), 8));
    /// ```
    pub fn contains(&self, address: Address, len: u64) -> bool
    {
        let Some(end) = address.value().checked_add(len) else {
            return false;
        };
        address >= self.low && end <= self.high.value()
    }

    /// Stack bounds of the calling thread, cached after the first query.
    pub fn current_thread() -> Option<Self>
    {
        CURRENT_BOUNDS.with(|cached| {
            if let Some(bounds) = cached.get() {
                return Some(bounds);
            }
            let bounds = query_stack_bounds()?;
            cached.set(Some(bounds));
            Some(bounds)
        })
    }
}

thread_local! {
    static CURRENT_BOUNDS: Cell<Option<StackBounds>> = const { Cell::new(None) };
}

/// Registers that seed a stack walk
///
/// `lr` is only meaningful on AArch64, where a leaf function may not have
/// spilled its return address into a frame record yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext
{
    /// Program counter (becomes frame 0)
    pub pc: Address,
    /// Stack pointer
    pub sp: Address,
    /// Frame pointer (`rbp` / `x29`)
    pub fp: Address,
    /// Link register (`x30`), when the architecture has one
    pub lr: Option<Address>,
    /// Range the walker is allowed to read
    pub stack: StackBounds,
}

impl ThreadContext
{
    /// Snapshot of the calling function's registers and the current thread's
    /// stack range.
    ///
    /// On architectures without a register reader every field is zero, which
    /// the walker reports as an empty trace.
    #[inline(always)]
    pub fn current() -> Self
    {
        let (pc, sp, fp, lr) = read_registers();
        let sp = Address::from(sp);
        let stack = StackBounds::current_thread().unwrap_or(StackBounds::empty_at(sp));
        Self {
            pc: Address::from(pc),
            sp,
            fp: Address::from(fp),
            lr: lr.map(Address::from),
            stack,
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn read_registers() -> (u64, u64, u64, Option<u64>)
{
    let pc: u64;
    let sp: u64;
    let fp: u64;
    // SAFETY: the instructions only copy register values into the outputs.
    unsafe {
        std::arch::asm!(
            "lea {pc}, [rip]",
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        );
    }
    (pc, sp, fp, None)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn read_registers() -> (u64, u64, u64, Option<u64>)
{
    let pc: u64;
    let sp: u64;
    let fp: u64;
    let lr: u64;
    // SAFETY: the instructions only copy register values into the outputs.
    unsafe {
        std::arch::asm!(
            "adr {pc}, .",
            "mov {sp}, sp",
            "mov {fp}, x29",
            "mov {lr}, x30",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            lr = out(reg) lr,
            options(nomem, nostack, preserves_flags),
        );
    }
    (pc, sp, fp, Some(lr))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn read_registers() -> (u64, u64, u64, Option<u64>)
{
    (0, 0, 0, None)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn query_stack_bounds() -> Option<StackBounds>
{
    // SAFETY: `attr` is initialised by pthread_getattr_np before use and
    // destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }

        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }

        let low = addr as u64;
        Some(StackBounds::new(Address::from(low), Address::from(low.saturating_add(size as u64))))
    }
}

#[cfg(target_os = "macos")]
fn query_stack_bounds() -> Option<StackBounds>
{
    // SAFETY: both calls only inspect the calling thread's own descriptor.
    unsafe {
        let thread = libc::pthread_self();
        let high = libc::pthread_get_stackaddr_np(thread) as u64;
        let size = libc::pthread_get_stacksize_np(thread) as u64;
        if high == 0 || size == 0 {
            return None;
        }
        Some(StackBounds::new(Address::from(high.saturating_sub(size)), Address::from(high)))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn query_stack_bounds() -> Option<StackBounds>
{
    None
}
