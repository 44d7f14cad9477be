//! # Capture Pipeline
//!
//! Ties the pieces together:
//!
//! ```text
//! FrameWalker -> ModuleRegistry::lookup -> SymbolResolver -> (pre-demangled names) -> TraceFormatter
//! ```
//!
//! [`StackTracer`] is the entry point. It holds one registry snapshot and one
//! resolver, both behind `Arc`, so a tracer can be cloned cheaply and shared
//! between threads.
//!
//! ## Capture variants
//!
//! - [`StackTracer::capture`]: the calling thread, frames in a `Vec`
//! - [`StackTracer::capture_into`]: the calling thread, frames in a caller
//!   slice
//! - [`StackTracer::capture_from`]: explicit registers over explicit memory
//! - [`StackTracer::capture_thread`]: another thread, through a
//!   [`ThreadControl`]
//! - [`StackTracer::capture_and_format_into`]: the crash path; no heap
//!   allocation, no logging, no index builds
//!
//! All but the crash path unwind with CFI wherever a module provides it. The
//! crash path does too once [`StackTracer::prepare`] has built the indices
//! and the reusable unwind state; otherwise it follows frame pointers only.
//!
//! None of them return an error: a capture always yields the best trace it
//! could get, flagged incomplete when it stopped early.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::TraceResult;
use crate::registry::{default_source, ModuleRegistry, ModuleSource};
use crate::render::{FormatOptions, TraceFormatter, Written};
use crate::symbols::{BuildMode, IndexLookup, SymbolResolver};
use crate::thread::ThreadControl;
use crate::types::{Address, StackBounds, StackTraceFrame, ThreadContext};
use crate::unwind::{FrameWalker, LocalStack, ModuleCfi, StackMemory, StackSnapshot, UnwindScratch, WalkStatus};

/// Default number of frames per capture.
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// Default stack window copied from a foreign thread.
pub const DEFAULT_MAX_STACK_COPY: usize = 512 * 1024;

/// What to capture and how far to resolve it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest
{
    pub max_frames: usize,
    /// Innermost caller frames to drop; they do not count toward `max_frames`
    pub skip_frames: usize,
    pub resolve_symbols: bool,
    pub resolve_lines: bool,
    pub demangle: bool,
    /// Wall-clock limit for resolution, counted from the start of the
    /// capture; frames not resolved in time are dropped
    pub resolve_budget: Option<Duration>,
    pub build_mode: BuildMode,
    /// Bytes of a foreign thread's stack copied before walking it
    pub max_stack_copy: usize,
}

impl Default for CaptureRequest
{
    fn default() -> Self
    {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            skip_frames: 0,
            resolve_symbols: true,
            resolve_lines: true,
            demangle: true,
            resolve_budget: None,
            build_mode: BuildMode::Blocking,
            max_stack_copy: DEFAULT_MAX_STACK_COPY,
        }
    }
}

impl CaptureRequest
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self
    {
        self.max_frames = max_frames;
        self
    }

    pub fn with_skip_frames(mut self, skip_frames: usize) -> Self
    {
        self.skip_frames = skip_frames;
        self
    }

    pub fn with_symbols(mut self, resolve_symbols: bool) -> Self
    {
        self.resolve_symbols = resolve_symbols;
        self
    }

    pub fn with_lines(mut self, resolve_lines: bool) -> Self
    {
        self.resolve_lines = resolve_lines;
        self
    }

    pub fn with_demangle(mut self, demangle: bool) -> Self
    {
        self.demangle = demangle;
        self
    }

    pub fn with_resolve_budget(mut self, budget: Duration) -> Self
    {
        self.resolve_budget = Some(budget);
        self
    }

    pub fn with_build_mode(mut self, build_mode: BuildMode) -> Self
    {
        self.build_mode = build_mode;
        self
    }

    pub fn with_max_stack_copy(mut self, bytes: usize) -> Self
    {
        self.max_stack_copy = bytes;
        self
    }
}

/// Read access to a captured trace, whoever owns the frames
pub trait Trace
{
    /// Frames, innermost first.
    fn frames(&self) -> &[StackTraceFrame];

    /// Whether the walk or the resolution stopped early.
    fn is_incomplete(&self) -> bool;
}

/// A trace whose frames live in a `Vec`
#[derive(Debug, Clone, Default)]
pub struct CaptureResult
{
    frames: Vec<StackTraceFrame>,
    incomplete: bool,
}

impl CaptureResult
{
    pub fn new(frames: Vec<StackTraceFrame>, incomplete: bool) -> Self
    {
        Self { frames, incomplete }
    }

    fn empty_incomplete() -> Self
    {
        Self::new(Vec::new(), true)
    }

    pub fn frames(&self) -> &[StackTraceFrame]
    {
        &self.frames
    }

    pub fn is_incomplete(&self) -> bool
    {
        self.incomplete
    }

    pub fn len(&self) -> usize
    {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> Vec<StackTraceFrame>
    {
        self.frames
    }
}

impl Trace for CaptureResult
{
    fn frames(&self) -> &[StackTraceFrame]
    {
        &self.frames
    }

    fn is_incomplete(&self) -> bool
    {
        self.incomplete
    }
}

/// A trace whose frames live in a caller-supplied slice
#[derive(Debug, Clone, Copy)]
pub struct CapturedSlice<'f>
{
    frames: &'f [StackTraceFrame],
    incomplete: bool,
}

impl<'f> CapturedSlice<'f>
{
    pub fn new(frames: &'f [StackTraceFrame], incomplete: bool) -> Self
    {
        Self { frames, incomplete }
    }

    pub fn frames(&self) -> &'f [StackTraceFrame]
    {
        self.frames
    }

    pub fn is_incomplete(&self) -> bool
    {
        self.incomplete
    }

    pub fn len(&self) -> usize
    {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.frames.is_empty()
    }
}

impl Trace for CapturedSlice<'_>
{
    fn frames(&self) -> &[StackTraceFrame]
    {
        self.frames
    }

    fn is_incomplete(&self) -> bool
    {
        self.incomplete
    }
}

/// Outcome of [`StackTracer::capture_and_format_into`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashReport
{
    /// Frames captured into the caller's slice
    pub frames: usize,
    pub incomplete: bool,
    /// What was written into the caller's byte buffer
    pub written: Written,
}

/// Where walked addresses are stored
trait FrameStore
{
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    fn push(&mut self, address: Address, return_address: bool);
}

impl FrameStore for Vec<StackTraceFrame>
{
    fn capacity(&self) -> usize
    {
        usize::MAX
    }

    fn len(&self) -> usize
    {
        Vec::len(self)
    }

    fn push(&mut self, address: Address, return_address: bool)
    {
        let mut frame = StackTraceFrame::default();
        frame.reset(Vec::len(self), address, return_address);
        Vec::push(self, frame);
    }
}

struct SliceStore<'a>
{
    frames: &'a mut [StackTraceFrame],
    len: usize,
}

impl FrameStore for SliceStore<'_>
{
    fn capacity(&self) -> usize
    {
        self.frames.len()
    }

    fn len(&self) -> usize
    {
        self.len
    }

    fn push(&mut self, address: Address, return_address: bool)
    {
        if let Some(frame) = self.frames.get_mut(self.len) {
            frame.reset(self.len, address, return_address);
            self.len += 1;
        }
    }
}

/// Captures and symbolicates stack traces against one registry snapshot
///
/// ## Example
///
/// ```rust,no_run
/// use stackwise_core::capture::{CaptureRequest, StackTracer};
/// use stackwise_core::render::{FormatOptions, TraceFormatter};
///
/// let tracer = StackTracer::for_current_process()?;
/// let trace = tracer.capture(&CaptureRequest::default().with_max_frames(16));
/// println!("{}", TraceFormatter::new(FormatOptions::default()).render(&trace));
/// # Ok::<(), stackwise_core::error::TraceError>(())
/// ```
#[derive(Debug, Clone)]
pub struct StackTracer
{
    registry: Arc<ModuleRegistry>,
    resolver: Arc<SymbolResolver>,
    /// CFI state for the crash path, allocated by `prepare`
    crash_scratch: Arc<Mutex<UnwindScratch>>,
}

impl StackTracer
{
    pub fn new(registry: Arc<ModuleRegistry>, resolver: Arc<SymbolResolver>) -> Self
    {
        Self {
            registry,
            resolver,
            crash_scratch: Arc::new(Mutex::new(UnwindScratch::default())),
        }
    }

    /// Tracer over the calling process's modules, read from the platform's
    /// default module source.
    pub fn for_current_process() -> TraceResult<Self>
    {
        let registry = ModuleRegistry::from_source(default_source().as_ref())?;
        Ok(Self::new(Arc::new(registry), Arc::new(SymbolResolver::new())))
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry>
    {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<SymbolResolver>
    {
        &self.resolver
    }

    /// Replace the registry snapshot, keeping indices of unchanged modules.
    pub fn refresh(&mut self, source: &dyn ModuleSource) -> TraceResult<()>
    {
        self.registry = Arc::new(self.registry.refresh(source)?);
        Ok(())
    }

    /// Build every module index (unwind tables included), allocate the
    /// crash path's unwind state and cache the calling thread's stack bounds.
    ///
    /// Call this before relying on [`Self::capture_and_format_into`], which
    /// only uses what already exists. Returns the number of modules that
    /// indexed successfully.
    pub fn prepare(&self) -> usize
    {
        let _ = StackBounds::current_thread();
        if let Ok(mut scratch) = self.crash_scratch.lock() {
            if !scratch.is_allocated() {
                *scratch = UnwindScratch::new();
            }
        }
        let indexed = self
            .registry
            .modules()
            .iter()
            .filter(|module| self.resolver.index(module, BuildMode::Blocking).ready().is_some())
            .count();
        debug!(indexed, modules = self.registry.len(), "prepared module indices");
        indexed
    }

    /// Capture the calling thread's stack.
    ///
    /// The first frame is the caller of `capture`.
    #[inline(never)]
    pub fn capture(&self, request: &CaptureRequest) -> CaptureResult
    {
        let context = ThreadContext::current();
        let memory = LocalStack::current(context.sp);
        self.capture_skipping(&context, &memory, request, 1)
    }

    /// [`Self::capture`] into a caller-supplied slice.
    ///
    /// At most `frames.len()` frames are captured; a longer stack marks the
    /// result incomplete.
    #[inline(never)]
    pub fn capture_into<'f>(&self, request: &CaptureRequest, frames: &'f mut [StackTraceFrame]) -> CapturedSlice<'f>
    {
        let context = ThreadContext::current();
        let memory = LocalStack::current(context.sp);
        let deadline = deadline_of(request);
        let cfi = ModuleCfi::new(&self.registry, &self.resolver, request.build_mode).with_deadline(deadline);
        let walker = FrameWalker::new(&memory).with_cfi(&cfi);

        let mut store = SliceStore { frames, len: 0 };
        let status = walk_into(
            &walker,
            &context,
            &mut UnwindScratch::default(),
            request.skip_frames + 1,
            request.max_frames,
            &mut store,
        );
        let SliceStore { frames, len } = store;

        let kept = self.resolve_until(&mut frames[..len], request, deadline);
        let frames: &'f [StackTraceFrame] = frames;
        CapturedSlice::new(&frames[..kept], !status.is_complete() || kept < len)
    }

    /// Walk from explicit registers over explicit memory and resolve.
    pub fn capture_from(&self, context: &ThreadContext, memory: &dyn StackMemory, request: &CaptureRequest) -> CaptureResult
    {
        self.capture_skipping(context, memory, request, 0)
    }

    fn capture_skipping(
        &self,
        context: &ThreadContext,
        memory: &dyn StackMemory,
        request: &CaptureRequest,
        internal_frames: usize,
    ) -> CaptureResult
    {
        let deadline = deadline_of(request);
        let cfi = ModuleCfi::new(&self.registry, &self.resolver, request.build_mode).with_deadline(deadline);
        let walker = FrameWalker::new(memory).with_cfi(&cfi);
        let mut frames = Vec::with_capacity(request.max_frames.min(DEFAULT_MAX_FRAMES));
        let status = walk_into(
            &walker,
            context,
            &mut UnwindScratch::default(),
            request.skip_frames + internal_frames,
            request.max_frames,
            &mut frames,
        );

        let walked = frames.len();
        let kept = self.resolve_until(&mut frames, request, deadline);
        frames.truncate(kept);

        let incomplete = !status.is_complete() || kept < walked;
        debug!(frames = kept, walked, incomplete, "captured stack trace");
        CaptureResult::new(frames, incomplete)
    }

    /// Capture another thread's stack through `control`.
    ///
    /// The thread is suspended only while its registers and stack window are
    /// copied, and is always resumed before the walk starts.
    pub fn capture_thread(&self, control: &dyn ThreadControl, request: &CaptureRequest) -> CaptureResult
    {
        if request.max_frames == 0 {
            return CaptureResult::default();
        }

        if let Err(err) = control.suspend() {
            debug!(error = %err, "could not suspend thread");
            return CaptureResult::empty_incomplete();
        }
        let copied = control
            .context()
            .and_then(|context| control.read_stack(context.sp, request.max_stack_copy).map(|stack| (context, stack)));
        if let Err(err) = control.resume() {
            warn!(error = %err, "failed to resume thread after copying its stack");
        }

        let (mut context, stack) = match copied {
            Ok(copied) => copied,
            Err(err) => {
                debug!(error = %err, "could not copy thread state");
                return CaptureResult::empty_incomplete();
            }
        };
        if !context_matches_copy(&context, &stack) {
            debug!(pc = %context.pc, sp = %context.sp, fp = %context.fp, "thread context inconsistent with stack copy");
            return CaptureResult::empty_incomplete();
        }

        context.stack = stack.bounds();
        self.capture_from(&context, &stack, request)
    }

    /// Resolve `frames` in place.
    ///
    /// Frames are resolved independently, innermost first. Returns the number
    /// of leading frames that were resolved before the request's budget ran
    /// out; the rest should be dropped.
    pub fn resolve_frames(&self, frames: &mut [StackTraceFrame], request: &CaptureRequest) -> usize
    {
        self.resolve_until(frames, request, deadline_of(request))
    }

    fn resolve_until(&self, frames: &mut [StackTraceFrame], request: &CaptureRequest, deadline: Option<Instant>) -> usize
    {
        for (i, frame) in frames.iter_mut().enumerate() {
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline || !self.index_ready_by(frame.address(), request, deadline - now) {
                    return i;
                }
            }
            self.resolve_frame(frame, request, request.build_mode);
        }
        frames.len()
    }

    /// Whether the module holding `address` is indexed, or known to be
    /// unindexable, within `remaining`. An index build cannot be
    /// interrupted, so it runs on a worker thread while this call waits.
    fn index_ready_by(&self, address: Address, request: &CaptureRequest, remaining: Duration) -> bool
    {
        if request.build_mode == BuildMode::CachedOnly || !(request.resolve_symbols || request.resolve_lines) {
            return true;
        }
        let Some(module) = self.registry.lookup(address) else {
            return true;
        };
        !matches!(self.resolver.index_within(module, remaining), IndexLookup::Pending)
    }

    fn resolve_frame(&self, frame: &mut StackTraceFrame, request: &CaptureRequest, mode: BuildMode)
    {
        let address = frame.address();
        let Some(module) = self.registry.lookup(address) else {
            return;
        };
        let Some(offset) = module.offset_of(address) else {
            return;
        };
        frame.set_module(Arc::clone(module), offset);

        if !request.resolve_symbols && !request.resolve_lines {
            return;
        }
        let Some(index) = self.resolver.index(module, mode).ready() else {
            return;
        };
        let Some(lookup) = frame.lookup_offset() else {
            return;
        };

        if request.resolve_symbols {
            if let Some(found) = index.symbols().lookup(lookup) {
                let entry = found.entry;
                frame.set_symbol(Arc::clone(&entry.name), offset - entry.start, entry.demangled.clone());
                if !request.demangle {
                    frame.clear_demangled();
                }
            }
        }
        if request.resolve_lines {
            if let Some(row) = index.lines().lookup(lookup) {
                frame.set_line(Arc::clone(&row.file), row.line);
            }
        }
    }

    /// Capture the calling thread's stack and render it, without touching
    /// the heap.
    ///
    /// Meant for crash handlers:
    ///
    /// - frames go into `frames`, text into `out`
    /// - only indices and unwind state built by [`Self::prepare`] are used;
    ///   without them only the frame-pointer chain is followed
    /// - names come pre-demangled from the index
    /// - a capture racing another one on the same tracer skips CFI rather
    ///   than wait
    #[inline(never)]
    pub fn capture_and_format_into(
        &self,
        request: &CaptureRequest,
        options: &FormatOptions,
        frames: &mut [StackTraceFrame],
        out: &mut [u8],
    ) -> CrashReport
    {
        let context = ThreadContext::current();
        let memory = LocalStack::current(context.sp);

        let cfi = ModuleCfi::new(&self.registry, &self.resolver, BuildMode::CachedOnly);
        let mut scratch = self.crash_scratch.try_lock().ok().filter(|scratch| scratch.is_allocated());
        let skip = request.skip_frames + 1;

        let mut store = SliceStore { frames, len: 0 };
        let status = match scratch.as_deref_mut() {
            Some(scratch) => {
                let walker = FrameWalker::new(&memory).with_cfi(&cfi).quiet();
                walk_into(&walker, &context, scratch, skip, request.max_frames, &mut store)
            }
            None => {
                let walker = FrameWalker::new(&memory).quiet();
                // Frame pointers alone never touch the scratch state
                walk_into(&walker, &context, &mut UnwindScratch::default(), skip, request.max_frames, &mut store)
            }
        };
        drop(scratch);
        let SliceStore { frames, len } = store;

        let deadline = request.resolve_budget.map(|budget| Instant::now() + budget);
        let mut kept = len;
        for (i, frame) in frames[..len].iter_mut().enumerate() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                kept = i;
                break;
            }
            self.resolve_frame(frame, request, BuildMode::CachedOnly);
        }

        let incomplete = !status.is_complete() || kept < len;
        let trace = CapturedSlice::new(&frames[..kept], incomplete);
        let written = TraceFormatter::new(*options).write_into(&trace, out);

        CrashReport {
            frames: kept,
            incomplete,
            written,
        }
    }
}

fn deadline_of(request: &CaptureRequest) -> Option<Instant>
{
    request.resolve_budget.map(|budget| Instant::now() + budget)
}

/// Walk into `store`, marking every frame after the first emitted one as a
/// return address.
fn walk_into(
    walker: &FrameWalker<'_>,
    context: &ThreadContext,
    scratch: &mut UnwindScratch,
    skip: usize,
    max: usize,
    store: &mut impl FrameStore,
) -> WalkStatus
{
    let max = max.min(store.capacity());
    walker.walk_with_scratch(context, skip, max, scratch, |address| {
        let return_address = skip > 0 || store.len() > 0;
        store.push(address, return_address);
    })
}

/// Whether a suspended thread's registers point into the copied window.
fn context_matches_copy(context: &ThreadContext, stack: &StackSnapshot) -> bool
{
    let bounds = stack.bounds();
    context.pc != Address::ZERO
        && !bounds.is_empty()
        && bounds.contains(context.sp, 1)
        && (context.fp == Address::ZERO || bounds.contains(context.fp, 16))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_request_defaults_and_builders()
    {
        let request = CaptureRequest::default();
        assert_eq!(request.max_frames, 64);
        assert_eq!(request.max_stack_copy, 512 * 1024);
        assert!(request.resolve_symbols && request.resolve_lines && request.demangle);
        assert_eq!(request.build_mode, BuildMode::Blocking);

        let request = request
            .with_max_frames(8)
            .with_skip_frames(2)
            .with_lines(false)
            .with_build_mode(BuildMode::CachedOnly)
            .with_resolve_budget(Duration::from_millis(5));
        assert_eq!((request.max_frames, request.skip_frames), (8, 2));
        assert!(!request.resolve_lines);
        assert_eq!(request.resolve_budget, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_slice_store_stops_at_capacity()
    {
        let mut frames = vec![StackTraceFrame::default(); 2];
        let mut store = SliceStore {
            frames: &mut frames,
            len: 0,
        };
        for address in [0x10u64, 0x20, 0x30] {
            store.push(Address::from(address), store.len > 0);
        }
        assert_eq!(store.len, 2);
        assert_eq!(frames[1].address(), Address::from(0x20));
        assert!(frames[1].is_return_address());
        assert!(!frames[0].is_return_address());
    }

    #[test]
    fn test_context_must_point_into_copy()
    {
        let stack = StackSnapshot::from_words(Address::from(0x1000), &[0; 8]);
        let mut context = ThreadContext {
            pc: Address::from(0x40_0000),
            sp: Address::from(0x1000),
            fp: Address::from(0x1010),
            ..ThreadContext::default()
        };
        assert!(context_matches_copy(&context, &stack));

        context.fp = Address::from(0x9000);
        assert!(!context_matches_copy(&context, &stack));

        context.fp = Address::ZERO;
        context.pc = Address::ZERO;
        assert!(!context_matches_copy(&context, &stack));
    }

    #[test]
    fn test_capture_own_stack_is_bounded()
    {
        let tracer = StackTracer::new(Arc::new(ModuleRegistry::empty()), Arc::new(SymbolResolver::new()));
        let trace = tracer.capture(&CaptureRequest::default().with_max_frames(4));
        assert!(trace.len() <= 4);

        let trace = tracer.capture(&CaptureRequest::default().with_max_frames(0));
        assert!(trace.is_empty());
        assert!(!trace.is_incomplete());
    }
}
