//! # Stack Unwinding
//!
//! Produces the ordered sequence of return addresses for a thread, innermost
//! first.
//!
//! ## Strategy
//!
//! 1. **DWARF CFI** (primary): when the module containing the program counter
//!    has an `.eh_frame` entry for it, that entry is evaluated (see [`cfi`]).
//!    Code built without frame pointers leaves a stale but plausible value in
//!    `rbp`, so the frame pointer cannot be trusted while CFI is available.
//! 2. **Frame-pointer chain** (fallback): `[fp]` holds the caller's frame
//!    pointer and `[fp + 8]` the return address. This is the record layout of
//!    both x86-64 (`rbp`) and AArch64 (`x29`/`x30`). It is used for frames no
//!    CFI covers and when evaluating the CFI fails.
//!
//! A frame pointer is plausible when it is 8-byte aligned, lies inside the
//! stack bounds, is not below the stack pointer and is strictly above the
//! last frame pointer the chain consumed. The last rule is what keeps a
//! corrupted, cyclic chain from looping.
//!
//! ## Termination
//!
//! - `fp == 0` with no CFI row, a zero return address, or a CFI row marking
//!   the return address undefined: the thread entry was reached and the walk
//!   is [`WalkStatus::Complete`]
//! - the frame limit is hit while another frame exists, or no strategy can
//!   make progress: [`WalkStatus::Incomplete`]

pub mod cfi;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gimli::UnwindContext;
use tracing::trace;

pub use cfi::{CfiError, CfiStep, CfiTable};
pub use memory::{LocalStack, StackMemory, StackSnapshot};

use crate::registry::ModuleRegistry;
use crate::symbols::{BuildMode, SymbolResolver};
use crate::types::{Address, ThreadContext};

/// Upper bound on frames visited by one walk, skipped frames included.
pub const MAX_WALK_STEPS: usize = 4096;

/// Whether a walk reached the outermost frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus
{
    Complete,
    Incomplete,
}

impl WalkStatus
{
    pub fn is_complete(self) -> bool
    {
        self == WalkStatus::Complete
    }
}

/// Registers tracked from frame to frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameRegisters
{
    pub pc: Address,
    pub sp: Address,
    pub fp: Address,
    /// Only known for the innermost frame on AArch64
    pub lr: Option<Address>,
}

impl From<&ThreadContext> for FrameRegisters
{
    fn from(context: &ThreadContext) -> Self
    {
        Self {
            pc: context.pc,
            sp: context.sp,
            fp: context.fp,
            lr: context.lr,
        }
    }
}

/// Lookup of unwind tables by address
pub trait CfiSource
{
    /// CFI of the module containing `address`, with `address`'s offset in it.
    fn cfi_for(&self, address: Address) -> Option<(Arc<CfiTable>, u64)>;
}

/// [`CfiSource`] backed by a registry snapshot and the module indices
pub struct ModuleCfi<'a>
{
    registry: &'a ModuleRegistry,
    resolver: &'a Arc<SymbolResolver>,
    mode: BuildMode,
    deadline: Option<Instant>,
}

impl<'a> ModuleCfi<'a>
{
    pub fn new(registry: &'a ModuleRegistry, resolver: &'a Arc<SymbolResolver>, mode: BuildMode) -> Self
    {
        Self {
            registry,
            resolver,
            mode,
            deadline: None,
        }
    }

    /// Stop waiting for index builds at `deadline`; frames whose module is
    /// not indexed by then fall back to the frame-pointer chain.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self
    {
        self.deadline = deadline;
        self
    }
}

impl CfiSource for ModuleCfi<'_>
{
    fn cfi_for(&self, address: Address) -> Option<(Arc<CfiTable>, u64)>
    {
        let module = self.registry.lookup(address)?;
        let offset = module.offset_of(address)?;
        let lookup = match self.deadline {
            Some(deadline) if self.mode != BuildMode::CachedOnly => {
                let remaining = deadline.checked_duration_since(Instant::now()).unwrap_or(Duration::ZERO);
                self.resolver.index_within(module, remaining)
            }
            _ => self.resolver.index(module, self.mode),
        };
        let table = lookup.ready()?.cfi()?;
        Some((Arc::clone(table), offset))
    }
}

/// Reusable CFI evaluation state
///
/// Evaluating CFI needs a `gimli::UnwindContext`, which allocates when it is
/// created. [`UnwindScratch::new`] creates it up front so that walks using
/// [`FrameWalker::walk_with_scratch`] do not allocate; the default value
/// creates it lazily on the first CFI step.
#[derive(Default)]
pub struct UnwindScratch
{
    context: Option<UnwindContext<usize>>,
}

impl UnwindScratch
{
    pub fn new() -> Self
    {
        Self {
            context: Some(UnwindContext::new()),
        }
    }

    pub fn is_allocated(&self) -> bool
    {
        self.context.is_some()
    }

    fn context(&mut self) -> &mut UnwindContext<usize>
    {
        self.context.get_or_insert_with(UnwindContext::new)
    }
}

impl fmt::Debug for UnwindScratch
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("UnwindScratch").field("allocated", &self.is_allocated()).finish()
    }
}

enum Step
{
    Caller(FrameRegisters),
    End,
    Stuck,
}

/// Walks one thread's stack over bounds-checked memory
pub struct FrameWalker<'a>
{
    memory: &'a dyn StackMemory,
    cfi: Option<&'a dyn CfiSource>,
    quiet: bool,
}

impl<'a> FrameWalker<'a>
{
    /// Frame-pointer-only walker.
    pub fn new(memory: &'a dyn StackMemory) -> Self
    {
        Self {
            memory,
            cfi: None,
            quiet: false,
        }
    }

    /// Prefer CFI wherever `cfi` has a table for the frame.
    pub fn with_cfi(mut self, cfi: &'a dyn CfiSource) -> Self
    {
        self.cfi = Some(cfi);
        self
    }

    /// Emit no trace events, for callers that must not enter a subscriber.
    pub fn quiet(mut self) -> Self
    {
        self.quiet = true;
        self
    }

    /// Walk from `context`, handing each emitted address to `sink`.
    ///
    /// The first `skip` frames are walked but not emitted and do not count
    /// toward `max`. At most `max` addresses are emitted.
    ///
    /// ```rust
    /// use stackwise_core::types::{Address, ThreadContext};
    /// use stackwise_core::unwind::{FrameWalker, StackSnapshot, WalkStatus};
    ///
    /// // Two frame records: 0x1000 -> 0x1010 -> end of chain.
    /// let stack = StackSnapshot::from_words(Address::from(0x1000), &[0x1010, 0x4010, 0, 0]);
    /// let context = ThreadContext {
    ///     pc: Address::from(0x4000),
    ///     sp: Address::from(0x1000),
    ///     fp: Address::from(0x1000),
    ///     ..ThreadContext::default()
    /// };
    ///
    /// let mut frames = Vec::new();
    /// let status = FrameWalker::new(&stack).walk(&context, 0, 16, |pc| frames.push(pc.value()));
    /// assert_eq!(frames, vec![0x4000, 0x4010]);
    /// assert_eq!(status, WalkStatus::Complete);
    /// ```
    pub fn walk(&self, context: &ThreadContext, skip: usize, max: usize, sink: impl FnMut(Address)) -> WalkStatus
    {
        self.walk_with_scratch(context, skip, max, &mut UnwindScratch::default(), sink)
    }

    /// [`Self::walk`] reusing caller-owned CFI state.
    pub fn walk_with_scratch(
        &self,
        context: &ThreadContext,
        skip: usize,
        max: usize,
        scratch: &mut UnwindScratch,
        mut sink: impl FnMut(Address),
    ) -> WalkStatus
    {
        if max == 0 {
            return WalkStatus::Complete;
        }
        if context.pc == Address::ZERO {
            return WalkStatus::Incomplete;
        }

        let mut regs = FrameRegisters::from(context);
        let mut last_chain_fp: Option<Address> = None;
        let mut emitted = 0usize;

        for depth in 0..MAX_WALK_STEPS {
            if depth >= skip {
                sink(regs.pc);
                emitted += 1;
            }

            match self.step(&regs, depth > 0, &mut last_chain_fp, scratch) {
                Step::Caller(next) => {
                    if emitted >= max {
                        return WalkStatus::Incomplete;
                    }
                    regs = next;
                }
                Step::End => return WalkStatus::Complete,
                Step::Stuck => return WalkStatus::Incomplete,
            }
        }
        WalkStatus::Incomplete
    }

    fn step(
        &self,
        regs: &FrameRegisters,
        is_return_address: bool,
        last_chain_fp: &mut Option<Address>,
        scratch: &mut UnwindScratch,
    ) -> Step
    {
        let cfi = self.step_cfi(regs, is_return_address, scratch);
        let cfi_failed = match cfi {
            Some(Step::Stuck) => true,
            Some(step) => return step,
            None => false,
        };

        if regs.fp == Address::ZERO {
            return if cfi_failed { Step::Stuck } else { Step::End };
        }
        if !self.plausible_fp(regs, *last_chain_fp) {
            return Step::Stuck;
        }

        let (Ok(saved_fp), Ok(return_address)) = (
            self.memory.read_u64(regs.fp),
            self.memory.read_u64(Address::from(regs.fp.value() + 8)),
        ) else {
            return Step::Stuck;
        };
        if return_address == 0 {
            return Step::End;
        }
        *last_chain_fp = Some(regs.fp);
        Step::Caller(FrameRegisters {
            pc: Address::from(return_address),
            sp: Address::from(regs.fp.value() + 16),
            fp: Address::from(saved_fp),
            lr: None,
        })
    }

    fn plausible_fp(&self, regs: &FrameRegisters, last_chain_fp: Option<Address>) -> bool
    {
        let fp = regs.fp;
        fp.is_aligned(8)
            && self.memory.bounds().contains(fp, 16)
            && fp >= regs.sp
            && last_chain_fp.is_none_or(|last| fp > last)
    }

    /// One CFI step, or `None` when no table covers the frame.
    fn step_cfi(&self, regs: &FrameRegisters, is_return_address: bool, scratch: &mut UnwindScratch) -> Option<Step>
    {
        let cfi = self.cfi?;
        let lookup = if is_return_address {
            regs.pc.checked_sub(1)?
        } else {
            regs.pc
        };
        let (table, offset) = cfi.cfi_for(lookup)?;

        match table.step(scratch.context(), offset, regs, self.memory) {
            Ok(CfiStep::Caller(next)) if next.pc == Address::ZERO => Some(Step::End),
            Ok(CfiStep::Caller(next)) if next.sp > regs.sp => {
                if !self.quiet {
                    trace!(pc = %regs.pc, caller = %next.pc, cfa = %next.sp, "unwound frame with CFI");
                }
                Some(Step::Caller(next))
            }
            Ok(CfiStep::Caller(next)) => {
                if !self.quiet {
                    trace!(pc = %regs.pc, cfa = %next.sp, "CFI did not advance the stack");
                }
                Some(Step::Stuck)
            }
            Ok(CfiStep::EndOfStack) => Some(Step::End),
            Ok(CfiStep::NoEntry) => None,
            Err(err) => {
                if !self.quiet {
                    trace!(pc = %regs.pc, error = %err, "CFI step failed");
                }
                Some(Step::Stuck)
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const BASE: u64 = 0x7000;

    fn context(fp: u64) -> ThreadContext
    {
        ThreadContext {
            pc: Address::from(0x40_1000),
            sp: Address::from(BASE),
            fp: Address::from(fp),
            ..ThreadContext::default()
        }
    }

    fn walk(stack: &StackSnapshot, context: &ThreadContext, skip: usize, max: usize) -> (Vec<u64>, WalkStatus)
    {
        let mut frames = Vec::new();
        let status = FrameWalker::new(stack).walk(context, skip, max, |pc| frames.push(pc.value()));
        (frames, status)
    }

    /// Three chained records ending in a null frame pointer.
    fn chain() -> StackSnapshot
    {
        StackSnapshot::from_words(
            Address::from(BASE),
            &[BASE + 0x10, 0x40_2000, BASE + 0x20, 0x40_3000, 0, 0x40_4000, 0, 0],
        )
    }

    #[test]
    fn test_full_chain_is_complete()
    {
        let (frames, status) = walk(&chain(), &context(BASE), 0, 64);
        assert_eq!(frames, vec![0x40_1000, 0x40_2000, 0x40_3000, 0x40_4000]);
        assert_eq!(status, WalkStatus::Complete);
    }

    #[test]
    fn test_max_truncates_and_marks_incomplete()
    {
        let (frames, status) = walk(&chain(), &context(BASE), 0, 2);
        assert_eq!(frames, vec![0x40_1000, 0x40_2000]);
        assert_eq!(status, WalkStatus::Incomplete);
    }

    #[test]
    fn test_max_equal_to_depth_is_complete()
    {
        let (frames, status) = walk(&chain(), &context(BASE), 0, 4);
        assert_eq!(frames.len(), 4);
        assert_eq!(status, WalkStatus::Complete);
    }

    #[test]
    fn test_skip_does_not_count_toward_max()
    {
        let (frames, status) = walk(&chain(), &context(BASE), 2, 2);
        assert_eq!(frames, vec![0x40_3000, 0x40_4000]);
        assert_eq!(status, WalkStatus::Complete);
    }

    #[test]
    fn test_zero_max_is_empty_and_complete()
    {
        let (frames, status) = walk(&StackSnapshot::default(), &context(BASE), 0, 0);
        assert!(frames.is_empty());
        assert_eq!(status, WalkStatus::Complete);
    }

    #[test]
    fn test_zero_pc_is_empty_and_incomplete()
    {
        let mut context = context(BASE);
        context.pc = Address::ZERO;
        let (frames, status) = walk(&chain(), &context, 0, 8);
        assert!(frames.is_empty());
        assert_eq!(status, WalkStatus::Incomplete);
    }

    #[test]
    fn test_cyclic_chain_is_bounded()
    {
        let stack = StackSnapshot::from_words(Address::from(BASE), &[BASE, 0x40_2000]);
        let (frames, status) = walk(&stack, &context(BASE), 0, 64);
        assert_eq!(frames, vec![0x40_1000, 0x40_2000]);
        assert_eq!(status, WalkStatus::Incomplete);
    }

    #[test]
    fn test_fp_outside_stack_stops_without_cfi()
    {
        let (frames, status) = walk(&chain(), &context(0xdead_0000), 0, 8);
        assert_eq!(frames, vec![0x40_1000]);
        assert_eq!(status, WalkStatus::Incomplete);
    }

    #[test]
    fn test_misaligned_fp_is_rejected()
    {
        let (frames, status) = walk(&chain(), &context(BASE + 4), 0, 8);
        assert_eq!(frames.len(), 1);
        assert_eq!(status, WalkStatus::Incomplete);
    }

    #[test]
    fn test_null_fp_without_cfi_is_thread_entry()
    {
        let (frames, status) = walk(&chain(), &context(0), 0, 8);
        assert_eq!(frames, vec![0x40_1000]);
        assert_eq!(status, WalkStatus::Complete);
    }

    /// Covers `cfi::tests::FUNCTION` only, with the module loaded at 0.
    struct OneFunction(Arc<CfiTable>);

    impl CfiSource for OneFunction
    {
        fn cfi_for(&self, address: Address) -> Option<(Arc<CfiTable>, u64)>
        {
            let start = cfi::tests::FUNCTION;
            (start..start + cfi::tests::FUNCTION_LEN)
                .contains(&address.value())
                .then(|| (Arc::clone(&self.0), address.value()))
        }
    }

    /// Frame 0 has CFI and no frame record of its own; `fp` is a stale value
    /// left by a caller further up, pointing at a record two frames out.
    fn stale_fp_stack() -> (StackSnapshot, ThreadContext, OneFunction)
    {
        use gimli::write::CallFrameInstruction;

        let table = cfi::tests::x86_table(vec![CallFrameInstruction::CfaOffset(16)]);
        let stack = StackSnapshot::from_words(Address::from(BASE), &[0, 0x2010, 0, 0, 0, 0x3010]);
        let context = ThreadContext {
            pc: Address::from(0x1010),
            sp: Address::from(BASE),
            fp: Address::from(BASE + 0x20),
            ..ThreadContext::default()
        };
        (stack, context, OneFunction(Arc::new(table)))
    }

    #[test]
    fn test_cfi_preferred_over_stale_frame_pointer()
    {
        let (stack, context, cfi) = stale_fp_stack();

        let mut frames = Vec::new();
        let status = FrameWalker::new(&stack)
            .with_cfi(&cfi)
            .walk(&context, 0, 16, |pc| frames.push(pc.value()));
        assert_eq!(frames, vec![0x1010, 0x2010, 0x3010]);
        assert_eq!(status, WalkStatus::Complete);

        // Following the stale pointer alone loses the caller
        let (frames, _) = walk(&stack, &context, 0, 16);
        assert_eq!(frames, vec![0x1010, 0x3010]);
    }

    #[test]
    fn test_prepared_scratch_is_reused()
    {
        let (stack, context, cfi) = stale_fp_stack();
        let mut scratch = UnwindScratch::new();
        assert!(scratch.is_allocated());

        for _ in 0..2 {
            let mut frames = Vec::new();
            let status = FrameWalker::new(&stack).with_cfi(&cfi).quiet().walk_with_scratch(
                &context,
                1,
                16,
                &mut scratch,
                |pc| frames.push(pc.value()),
            );
            assert_eq!(frames, vec![0x2010, 0x3010]);
            assert!(status.is_complete());
        }
    }

    #[test]
    fn test_failed_cfi_falls_back_to_frame_pointer()
    {
        use gimli::write::CallFrameInstruction;

        // CFA lands outside the stack, so the CFI step cannot read the return address
        let table = cfi::tests::x86_table(vec![CallFrameInstruction::CfaOffset(0x1000)]);
        let cfi = OneFunction(Arc::new(table));
        let mut context = context(BASE);
        context.pc = Address::from(0x1010);

        let mut frames = Vec::new();
        let status = FrameWalker::new(&chain())
            .with_cfi(&cfi)
            .walk(&context, 0, 16, |pc| frames.push(pc.value()));
        assert_eq!(frames, vec![0x1010, 0x40_2000, 0x40_3000, 0x40_4000]);
        assert_eq!(status, WalkStatus::Complete);
    }
}
